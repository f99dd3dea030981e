//! State guarded by the stream's pipeline lock, and the per-frame cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::chain::{ChainContext, StageChain};
use crate::command::Command;
use crate::events::{StreamFrame, StreamListeners, StreamOutput};
use crate::frame::{FpsCounter, FrameBundle};
use crate::ingest::{CaptureSettings, InputSource};
use crate::params::{Parameter, ParameterGroup};
use crate::persist::{SourceDescriptor, StageDescriptor, StreamDescriptor};
use crate::registry::{SourceRegistry, StageRegistry};
use crate::transform::TransformState;

/// Result of one pass of the capture loop.
pub(crate) enum Cycle {
    /// No source, or the stream is not configured yet.
    Idle,
    /// The source had nothing new.
    NoFrame,
    /// A frame went through the chain and was published.
    Published(StreamFrame),
}

/// Everything the capture thread mutates. One coarse lock protects it all:
/// the source handle, the chain, the transform state and the listeners.
pub(crate) struct Pipeline {
    name: String,
    source: Option<Box<dyn InputSource>>,
    capture: CaptureSettings,
    configured: bool,
    chain: StageChain,
    transform: TransformState,
    mirror: bool,
    flip: bool,
    fps: FpsCounter,
    frame_number: u64,
    pub(crate) listeners: StreamListeners,
    stages: Arc<StageRegistry>,
    sources: Arc<SourceRegistry>,
}

impl Pipeline {
    pub(crate) fn new(
        name: &str,
        width: u32,
        height: u32,
        stages: Arc<StageRegistry>,
        sources: Arc<SourceRegistry>,
    ) -> Result<Self> {
        let transform = TransformState::new(width, height)?;
        Ok(Self {
            name: name.to_string(),
            source: None,
            capture: CaptureSettings::default(),
            configured: false,
            chain: StageChain::new(ChainContext::new(name, width, height)),
            transform,
            mirror: false,
            flip: false,
            fps: FpsCounter::new(),
            frame_number: 0,
            listeners: StreamListeners::default(),
            stages,
            sources,
        })
    }

    pub(crate) fn chain(&self) -> &StageChain {
        &self.chain
    }

    pub(crate) fn chain_mut(&mut self) -> &mut StageChain {
        &mut self.chain
    }

    pub(crate) fn transform(&self) -> &TransformState {
        &self.transform
    }

    pub(crate) fn stage_registry(&self) -> &Arc<StageRegistry> {
        &self.stages
    }

    pub(crate) fn is_configured(&self) -> bool {
        self.configured
    }

    pub(crate) fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub(crate) fn fps(&self) -> f32 {
        self.fps.fps()
    }

    /// One-time setup before the first start: size the chain and open the
    /// source, if one is attached. Errors leave the stream unconfigured.
    pub(crate) fn configure(&mut self) -> Result<()> {
        if self.configured {
            return Ok(());
        }
        let (width, height) = self.transform.size();
        self.chain.set_process_size(width, height);
        if let Some(source) = self.source.as_mut() {
            source
                .setup(&self.capture)
                .with_context(|| format!("{}: set up input source", self.name))?;
            source
                .start()
                .with_context(|| format!("{}: start input source", self.name))?;
        }
        self.configured = true;
        log::info!("{}: configured at {}x{}", self.name, width, height);
        Ok(())
    }

    /// Close and release the source. The stream must be configured again
    /// before the next start.
    pub(crate) fn release_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
            log::info!("{}: released {} source", self.name, source.type_name());
        }
        self.configured = false;
    }

    /// Open the incoming source first when the stream is configured; only
    /// once it is running is the previous one closed and replaced.
    fn install_source(
        &mut self,
        mut source: Box<dyn InputSource>,
        settings: CaptureSettings,
    ) -> Result<()> {
        if self.configured {
            if let Err(err) = source.setup(&settings).and_then(|()| source.start()) {
                source.close();
                return Err(err).with_context(|| {
                    format!("{}: open {} source", self.name, source.type_name())
                });
            }
        }
        if let Some(mut previous) = self.source.take() {
            previous.close();
        }
        log::info!(
            "{}: input source is now {} ({})",
            self.name,
            source.type_name(),
            settings.device_id
        );
        self.capture = settings;
        self.source = Some(source);
        Ok(())
    }

    fn set_processing_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.transform.set_processing_size(width, height)?;
        self.chain.set_process_size(width, height);
        Ok(())
    }

    /// Apply one command. Failures leave prior state in place.
    pub(crate) fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::ResizeTo { width, height } => self.set_processing_size(width, height),
            Command::SetRoi(region) => self.transform.set_roi(region),
            Command::SetOutputRegion(region) => self.transform.set_output_region(region),
            Command::SetUseRoi(use_roi) => self.transform.set_use_roi(use_roi),
            Command::SetMirror { mirror, flip } => {
                self.mirror = mirror;
                self.flip = flip;
                Ok(())
            }
            Command::SetInputSource(descriptor) => {
                let source = self
                    .sources
                    .create(&descriptor.type_name, descriptor.settings.device_id.clone())
                    .ok_or_else(|| {
                        anyhow!("unknown input source type '{}'", descriptor.type_name)
                    })?;
                self.install_source(source, descriptor.settings)
            }
            Command::ReplaceInputSource(source) => {
                let settings = source.settings().clone();
                self.install_source(source, settings)
            }
            Command::SetCaptureResolution { width, height } => {
                if width == 0 || height == 0 {
                    return Err(anyhow!("capture size must be non-zero"));
                }
                self.capture.width = width;
                self.capture.height = height;
                match self.source.as_mut() {
                    Some(source) if self.configured => source.setup(&self.capture),
                    _ => Ok(()),
                }
            }
            Command::AddStage { stage, index } => {
                let index = index.unwrap_or(self.chain.len());
                self.chain.add_stage(stage, index)
            }
            Command::RemoveStage(selector) => {
                self.chain.remove_stage(&selector);
                Ok(())
            }
            Command::SwapStages(first, second) => self.chain.swap(first, second),
            Command::SetStageActive { stage, active } => self.chain.set_stage_active(&stage, active),
            Command::SetStageParameter { stage, name, value } => {
                self.chain.set_stage_parameter(&stage, &name, &value)
            }
            Command::RestoreStages(stages) => self.chain.restore(stages),
        }
    }

    /// Mirror/flip, resize to processing size, then warp the ROI if enabled.
    fn prepare(&self, raw: &DynamicImage) -> DynamicImage {
        let mut image = match (self.mirror, self.flip) {
            (false, false) => raw.clone(),
            (true, false) => raw.fliph(),
            (false, true) => raw.flipv(),
            (true, true) => raw.rotate180(),
        };
        let (width, height) = self.transform.size();
        if image.dimensions() != (width, height) {
            image = image.resize_exact(width, height, FilterType::Triangle);
        }
        match self.transform.warp_roi(&image) {
            Some(warped) => warped,
            None => image,
        }
    }

    /// One capture cycle. Runs with the pipeline lock held.
    pub(crate) fn cycle(&mut self, running: &AtomicBool) -> Cycle {
        if !self.configured {
            return Cycle::Idle;
        }
        let Some(source) = self.source.as_mut() else {
            return Cycle::Idle;
        };
        if let Err(err) = source.update() {
            log::error!("{}: source update failed: {:#}", self.name, err);
            return Cycle::NoFrame;
        }
        if !source.is_frame_new() {
            return Cycle::NoFrame;
        }
        let Some(raw) = source.pixels().cloned() else {
            return Cycle::NoFrame;
        };
        self.fps.tick();

        let prepared = self.prepare(&raw);
        if !running.load(Ordering::Acquire) {
            return Cycle::Idle;
        }

        let mut bundle = FrameBundle::new(raw, prepared);
        self.chain.run(&mut bundle);

        self.frame_number += 1;
        let fps = self.fps.fps();
        self.listeners.notify(&StreamOutput {
            stream: &self.name,
            result: &bundle.result,
            input: bundle.source(),
            fps,
            frame_number: self.frame_number,
        });

        let (input, result) = bundle.into_parts();
        Cycle::Published(StreamFrame {
            stream: self.name.clone(),
            result,
            input,
            fps,
            frame_number: self.frame_number,
        })
    }

    /// Stream-level parameters plus the chain's aggregate view.
    pub(crate) fn parameters(&self) -> ParameterGroup {
        let (width, height) = self.transform.size();
        let mut group = ParameterGroup::new(&self.name);
        group.add(Parameter::new("mirror", self.mirror));
        group.add(Parameter::new("flip", self.flip));
        group.add(Parameter::new("processing_width", width as i64));
        group.add(Parameter::new("processing_height", height as i64));
        group.add(Parameter::new("use_roi", self.transform.use_roi()));
        group.add(Parameter::new("capture_width", self.capture.width as i64));
        group.add(Parameter::new("capture_height", self.capture.height as i64));
        group.add_group(self.chain.parameters().clone());
        group
    }

    pub(crate) fn descriptor(&self) -> StreamDescriptor {
        let (width, height) = self.transform.size();
        let stages = self
            .chain
            .stages()
            .iter()
            .filter_map(|stage| match stage.lock() {
                Ok(guard) => Some(StageDescriptor::from_stage(&*guard)),
                Err(_) => {
                    log::error!("{}: stage lock poisoned while describing", self.name);
                    None
                }
            })
            .collect();
        StreamDescriptor {
            name: self.name.clone(),
            mirror: self.mirror,
            flip: self.flip,
            processing_width: width,
            processing_height: height,
            use_roi: self.transform.use_roi(),
            roi: self.transform.roi().clone(),
            output_region: self.transform.stored_output_region().clone(),
            source: self.source.as_ref().map(|source| SourceDescriptor {
                type_name: source.type_name().to_string(),
                settings: self.capture.clone(),
            }),
            stages,
        }
    }
}
