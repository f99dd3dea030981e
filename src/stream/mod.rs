//! Stream orchestrator.
//!
//! A `VideoStream` owns one capture thread, one input source, one stage
//! chain and the transform state between them. The thread loops: take the
//! pipeline lock, drain queued commands, poll the source, and push any new
//! frame through the chain before publishing the result.
//!
//! While the stream is running every mutation from another thread is
//! queued as a [`Command`] and applied by the capture thread under its own
//! lock. While it is stopped, commands are applied immediately. Source
//! changes are the exception: they are applied by the caller under the
//! pipeline lock, after anything already queued, so a device that fails to
//! open is reported to the caller and the previous source stays in place.

mod pipeline;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::chain::{ChainEvent, StageSelector};
use crate::command::{Command, CommandQueue, CommandSender};
use crate::events::{StreamFrame, StreamOutput};
use crate::ingest::InputSource;
use crate::params::{ParamValue, ParameterGroup};
use crate::persist::{SourceDescriptor, StreamDescriptor};
use crate::registry::{SourceRegistry, StageRegistry};
use crate::stage::SharedStage;
use crate::transform::{Region, TransformState};

use pipeline::{Cycle, Pipeline};

pub const DEFAULT_PROCESS_WIDTH: u32 = 320;
pub const DEFAULT_PROCESS_HEIGHT: u32 = 240;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub name: String,
    pub processing_width: u32,
    pub processing_height: u32,
    /// Back-off when there is no source or no new frame.
    pub poll_interval: Duration,
    /// How long `stop` waits for the capture thread before detaching it.
    pub stop_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            name: "stream".to_string(),
            processing_width: DEFAULT_PROCESS_WIDTH,
            processing_height: DEFAULT_PROCESS_HEIGHT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl StreamOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_processing_size(mut self, width: u32, height: u32) -> Self {
        self.processing_width = width;
        self.processing_height = height;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Running,
    Closed,
}

/// State shared with the capture thread.
struct Shared {
    name: String,
    pipeline: Mutex<Pipeline>,
    queue: CommandQueue,
    latest: Mutex<Option<StreamFrame>>,
    poll_interval: Duration,
}

impl Shared {
    fn pipeline(&self) -> Result<MutexGuard<'_, Pipeline>> {
        self.pipeline
            .lock()
            .map_err(|_| anyhow!("{}: pipeline lock poisoned", self.name))
    }

    /// Apply every queued command, logging the ones that fail.
    fn drain_into(&self, pipeline: &mut Pipeline) -> usize {
        self.queue.drain(|command| {
            let label = command.label();
            if let Err(err) = pipeline.apply(command) {
                log::warn!("{}: {} rejected: {:#}", self.name, label, err);
            }
        })
    }
}

/// One capture thread. Each thread gets its own run flag so a detached
/// thread cannot be revived by a later start.
struct Worker {
    run: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

struct Lifecycle {
    state: StreamState,
    worker: Option<Worker>,
}

pub struct VideoStream {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    stop_timeout: Duration,
}

fn capture_loop(
    shared: Arc<Shared>,
    run: Arc<AtomicBool>,
    done: crossbeam_channel::Sender<()>,
) {
    log::debug!("{}: capture thread started", shared.name);
    while run.load(Ordering::Acquire) {
        let outcome = match shared.pipeline() {
            // A newer thread may own the stream by the time the lock is won.
            Ok(_) if !run.load(Ordering::Acquire) => break,
            Ok(mut pipeline) => {
                shared.drain_into(&mut pipeline);
                pipeline.cycle(&run)
            }
            Err(err) => {
                log::error!("{:#}", err);
                break;
            }
        };
        match outcome {
            Cycle::Published(frame) => {
                match shared.latest.lock() {
                    Ok(mut latest) => *latest = Some(frame),
                    Err(_) => log::error!("{}: latest frame lock poisoned", shared.name),
                }
                thread::yield_now();
            }
            Cycle::Idle | Cycle::NoFrame => thread::sleep(shared.poll_interval),
        }
    }
    log::debug!("{}: capture thread exiting", shared.name);
    let _ = done.send(());
}

impl VideoStream {
    /// New stream using the built-in stage and source types.
    pub fn new(options: StreamOptions) -> Result<Self> {
        Self::with_registries(
            options,
            Arc::new(StageRegistry::with_builtin_stages()),
            Arc::new(SourceRegistry::with_builtin_sources()),
        )
    }

    pub fn with_registries(
        options: StreamOptions,
        stages: Arc<StageRegistry>,
        sources: Arc<SourceRegistry>,
    ) -> Result<Self> {
        let pipeline = Pipeline::new(
            &options.name,
            options.processing_width,
            options.processing_height,
            stages,
            sources,
        )
        .with_context(|| format!("create stream '{}'", options.name))?;
        Ok(Self {
            shared: Arc::new(Shared {
                name: options.name,
                pipeline: Mutex::new(pipeline),
                queue: CommandQueue::new(),
                latest: Mutex::new(None),
                poll_interval: options.poll_interval,
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: StreamState::Stopped,
                worker: None,
            }),
            stop_timeout: options.stop_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
        self.lifecycle
            .lock()
            .map_err(|_| anyhow!("{}: lifecycle lock poisoned", self.shared.name))
    }

    pub fn state(&self) -> StreamState {
        match self.lifecycle.lock() {
            Ok(lifecycle) => lifecycle.state,
            Err(_) => StreamState::Closed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// Stopped to Running. Runs the one-time setup first if needed; if the
    /// source fails to open the stream stays Stopped and the error is
    /// returned. Starting a running stream does nothing.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        match lifecycle.state {
            StreamState::Running => return Ok(()),
            StreamState::Closed => {
                return Err(anyhow!("{}: stream is closed", self.shared.name));
            }
            StreamState::Stopped => {}
        }
        {
            let mut pipeline = self.shared.pipeline()?;
            self.shared.drain_into(&mut pipeline);
            pipeline.configure()?;
        }

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let run = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&run);
        let handle = thread::Builder::new()
            .name(format!("stream-{}", self.shared.name))
            .spawn(move || capture_loop(shared, flag, done_tx))
            .map_err(|err| anyhow!("{}: spawn capture thread: {}", self.shared.name, err))?;
        lifecycle.worker = Some(Worker {
            run,
            handle,
            done: done_rx,
        });
        lifecycle.state = StreamState::Running;
        log::info!("{}: started", self.shared.name);
        Ok(())
    }

    /// Signal the capture thread and wait up to `stop_timeout` for it. A
    /// thread stuck inside a stage is detached and exits on its own.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        self.stop_locked(&mut lifecycle)
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        if lifecycle.state != StreamState::Running {
            return Ok(());
        }
        if let Some(worker) = lifecycle.worker.take() {
            worker.run.store(false, Ordering::Release);
            match worker.done.recv_timeout(self.stop_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        log::error!("{}: capture thread panicked", self.shared.name);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "{}: capture thread did not stop within {:?}, detaching",
                        self.shared.name,
                        self.stop_timeout
                    );
                }
            }
        }
        lifecycle.state = StreamState::Stopped;

        // Commands queued after the last cycle still apply.
        let mut pipeline = self.shared.pipeline()?;
        self.shared.drain_into(&mut pipeline);
        log::info!("{}: stopped", self.shared.name);
        Ok(())
    }

    /// Stop, then close and release the input source. Safe to call more
    /// than once; a closed stream cannot be started again.
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        if lifecycle.state == StreamState::Closed {
            return Ok(());
        }
        self.stop_locked(&mut lifecycle)?;
        self.shared.pipeline()?.release_source();
        lifecycle.state = StreamState::Closed;
        log::info!("{}: closed", self.shared.name);
        Ok(())
    }

    /// Queue `command` if the stream is running, apply it now otherwise.
    pub fn submit(&self, command: Command) -> Result<()> {
        let lifecycle = self.lifecycle()?;
        match lifecycle.state {
            StreamState::Running => self.shared.queue.push(command),
            StreamState::Stopped => self.shared.pipeline()?.apply(command),
            StreamState::Closed => Err(anyhow!(
                "{}: stream is closed, dropped {}",
                self.shared.name,
                command.label()
            )),
        }
    }

    /// Apply `command` under the pipeline lock even while running, after
    /// draining what is already queued, and return its error.
    fn submit_now(&self, command: Command) -> Result<()> {
        let lifecycle = self.lifecycle()?;
        if lifecycle.state == StreamState::Closed {
            return Err(anyhow!(
                "{}: stream is closed, dropped {}",
                self.shared.name,
                command.label()
            ));
        }
        let mut pipeline = self.shared.pipeline()?;
        self.shared.drain_into(&mut pipeline);
        pipeline.apply(command)
    }

    /// Handle for other threads. Commands sent through it are always
    /// queued and applied on the next cycle, or on `start`/`stop`.
    pub fn command_sender(&self) -> CommandSender {
        self.shared.queue.sender()
    }

    pub fn set_processing_size(&self, width: u32, height: u32) -> Result<()> {
        self.submit(Command::ResizeTo { width, height })
    }

    pub fn set_roi(&self, roi: Region) -> Result<()> {
        self.submit(Command::SetRoi(roi))
    }

    pub fn set_output_region(&self, region: Region) -> Result<()> {
        self.submit(Command::SetOutputRegion(region))
    }

    pub fn set_use_roi(&self, use_roi: bool) -> Result<()> {
        self.submit(Command::SetUseRoi(use_roi))
    }

    pub fn set_mirror(&self, mirror: bool, flip: bool) -> Result<()> {
        self.submit(Command::SetMirror { mirror, flip })
    }

    /// Build a source of the described type and swap it in.
    pub fn set_input_source(&self, descriptor: SourceDescriptor) -> Result<()> {
        self.submit_now(Command::SetInputSource(descriptor))
    }

    pub fn replace_input_source(&self, source: Box<dyn InputSource>) -> Result<()> {
        self.submit_now(Command::ReplaceInputSource(source))
    }

    pub fn set_capture_resolution(&self, width: u32, height: u32) -> Result<()> {
        self.submit_now(Command::SetCaptureResolution { width, height })
    }

    /// Insert at `index`, or append when `None`.
    pub fn add_stage(&self, stage: SharedStage, index: Option<usize>) -> Result<()> {
        self.submit(Command::AddStage { stage, index })
    }

    /// Create a stage through the registry and append it. Returns the
    /// handle so the caller can subscribe to it.
    pub fn add_stage_by_type(&self, type_name: &str) -> Result<SharedStage> {
        let stage = self
            .shared
            .pipeline()?
            .stage_registry()
            .create(type_name, ())
            .ok_or_else(|| anyhow!("unknown stage type '{}'", type_name))?;
        self.add_stage(Arc::clone(&stage), None)?;
        Ok(stage)
    }

    pub fn remove_stage(&self, selector: impl Into<StageSelector>) -> Result<()> {
        self.submit(Command::RemoveStage(selector.into()))
    }

    pub fn swap_stages(&self, first: usize, second: usize) -> Result<()> {
        self.submit(Command::SwapStages(first, second))
    }

    pub fn set_stage_active(&self, stage: impl Into<StageSelector>, active: bool) -> Result<()> {
        self.submit(Command::SetStageActive {
            stage: stage.into(),
            active,
        })
    }

    pub fn set_stage_parameter(
        &self,
        stage: impl Into<StageSelector>,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<()> {
        self.submit(Command::SetStageParameter {
            stage: stage.into(),
            name: name.to_string(),
            value: value.into(),
        })
    }

    pub fn stage_named(&self, name: &str) -> Result<Option<SharedStage>> {
        Ok(self.shared.pipeline()?.chain().stage_named(name))
    }

    pub fn stage_names(&self) -> Result<Vec<String>> {
        Ok(self.shared.pipeline()?.chain().names())
    }

    pub fn transform(&self) -> Result<TransformState> {
        Ok(self.shared.pipeline()?.transform().clone())
    }

    pub fn fps(&self) -> Result<f32> {
        Ok(self.shared.pipeline()?.fps())
    }

    pub fn has_source(&self) -> Result<bool> {
        Ok(self.shared.pipeline()?.has_source())
    }

    pub fn is_configured(&self) -> Result<bool> {
        Ok(self.shared.pipeline()?.is_configured())
    }

    /// Stream parameters with the chain's aggregate view nested inside.
    pub fn parameters(&self) -> Result<ParameterGroup> {
        Ok(self.shared.pipeline()?.parameters())
    }

    /// Fast notification, run on the capture thread after every cycle.
    pub fn on_frame<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&StreamOutput<'_>) + Send + 'static,
    {
        self.shared.pipeline()?.listeners.on_frame(callback);
        Ok(())
    }

    /// Safe notification: owned frames over a small bounded channel. Frames
    /// are dropped while the receiver lags behind.
    pub fn subscribe_frames(&self) -> Result<Receiver<StreamFrame>> {
        Ok(self.shared.pipeline()?.listeners.subscribe())
    }

    pub fn subscribe_chain_events(&self) -> Result<Receiver<ChainEvent>> {
        Ok(self.shared.pipeline()?.chain_mut().subscribe())
    }

    /// Most recent published frame. Does not take the pipeline lock.
    pub fn latest_frame(&self) -> Option<StreamFrame> {
        self.shared
            .latest
            .lock()
            .ok()
            .and_then(|latest| latest.clone())
    }

    pub fn descriptor(&self) -> Result<StreamDescriptor> {
        Ok(self.shared.pipeline()?.descriptor())
    }

    /// Reconfigure the stream from a descriptor. Stage types are resolved
    /// through the stream's registry; unknown types are skipped.
    pub fn apply_descriptor(&self, descriptor: &StreamDescriptor) -> Result<()> {
        let stages = {
            let pipeline = self.shared.pipeline()?;
            descriptor.build_stages(pipeline.stage_registry())
        };
        let (width, height) = (descriptor.processing_width, descriptor.processing_height);
        let roi = if descriptor.roi.is_empty() {
            Region::rectangle(0.0, 0.0, width as f32, height as f32)
        } else {
            descriptor.roi.clone()
        };

        self.set_mirror(descriptor.mirror, descriptor.flip)?;
        self.set_processing_size(width, height)?;
        self.set_roi(roi)?;
        self.set_output_region(descriptor.output_region.clone())?;
        self.set_use_roi(descriptor.use_roi)?;
        if let Some(source) = &descriptor.source {
            self.set_input_source(source.clone())?;
        }
        self.submit(Command::RestoreStages(stages))
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("{}: close on drop failed: {:#}", self.shared.name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ManualSource;
    use crate::stage::{shared, ThresholdStage};
    use std::time::Instant;

    fn stream() -> VideoStream {
        VideoStream::new(StreamOptions::named("unit").with_processing_size(4, 4)).expect("stream")
    }

    #[test]
    fn stopped_streams_apply_commands_immediately() -> Result<()> {
        let stream = stream();
        stream.add_stage(shared(ThresholdStage::new()), None)?;
        stream.add_stage(shared(ThresholdStage::new()), Some(0))?;
        assert_eq!(stream.stage_names()?, vec!["threshold_2", "threshold"]);

        stream.set_processing_size(8, 2)?;
        assert_eq!(stream.transform()?.size(), (8, 2));

        assert!(stream.set_roi(Region::new(vec![[0.0, 0.0], [1.0, 1.0]])).is_err());
        assert_eq!(stream.transform()?.size(), (8, 2));
        Ok(())
    }

    #[test]
    fn start_without_source_runs_idle() -> Result<()> {
        let stream = stream();
        stream.start()?;
        stream.start()?;
        assert_eq!(stream.state(), StreamState::Running);
        assert!(stream.is_configured()?);
        stream.stop()?;
        assert_eq!(stream.state(), StreamState::Stopped);
        Ok(())
    }

    #[test]
    fn closed_streams_stay_closed() -> Result<()> {
        let stream = stream();
        stream.replace_input_source(Box::new(ManualSource::new("feed")))?;
        stream.start()?;
        stream.close()?;
        stream.close()?;
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!stream.has_source()?);
        assert!(stream.start().is_err());
        assert!(stream.set_use_roi(true).is_err());
        Ok(())
    }

    #[test]
    fn sender_commands_apply_while_running() -> Result<()> {
        let stream = stream();
        stream.start()?;
        let sender = stream.command_sender();
        sender.send(Command::ResizeTo {
            width: 6,
            height: 3,
        })?;

        let deadline = Instant::now() + Duration::from_secs(2);
        while stream.transform()?.size() != (6, 3) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stream.transform()?.size(), (6, 3));
        stream.close()
    }

    #[test]
    fn unknown_stage_type_is_an_error() {
        let stream = stream();
        assert!(stream.add_stage_by_type("no_such_stage").is_err());
        assert!(stream.add_stage_by_type("threshold").is_ok());
    }
}
