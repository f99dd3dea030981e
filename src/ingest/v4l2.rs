//! V4L2 frame source.
//!
//! Captures RGB frames from a local device node (e.g., /dev/video0) on a
//! dedicated thread. The device id is either a full path or a bare index,
//! which maps to `/dev/video<index>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use ouroboros::self_referencing;

use super::normalize::{to_image, PixelFormat};
use super::{CaptureSettings, FrameSlot, InputSource, SourceStats};

/// How long `start` waits for the device to open.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct V4l2Source {
    settings: CaptureSettings,
    slot: FrameSlot,
    current: Option<DynamicImage>,
    frame_new: bool,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

fn device_path(device_id: &str) -> String {
    if device_id.chars().all(|c| c.is_ascii_digit()) && !device_id.is_empty() {
        format!("/dev/video{}", device_id)
    } else {
        device_id.to_string()
    }
}

/// Open the device and negotiate format. Returns the state and the
/// dimensions the driver settled on.
fn open_device(settings: &CaptureSettings) -> Result<(DeviceState, u32, u32)> {
    use v4l::buffer::Type;
    use v4l::video::Capture;

    let path = device_path(&settings.device_id);
    let device = v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {}", path))?;
    let mut format = device.format().context("read v4l2 format")?;
    format.width = settings.width;
    format.height = settings.height;
    format.fourcc = v4l::FourCC::new(b"RGB3");

    let format = match device.set_format(&format) {
        Ok(format) => format,
        Err(err) => {
            log::warn!("V4l2Source: failed to set format on {}: {}", path, err);
            device
                .format()
                .context("read v4l2 format after set failure")?
        }
    };

    if settings.fps > 0 {
        let params = v4l::video::capture::Parameters::with_fps(settings.fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!("V4l2Source: failed to set fps on {}: {}", path, err);
        }
    }

    let state = DeviceStateBuilder {
        device,
        stream_builder: |device| {
            v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
        },
    }
    .try_build()?;

    log::info!(
        "V4l2Source: connected to {} ({}x{})",
        path,
        format.width,
        format.height
    );
    Ok((state, format.width, format.height))
}

fn capture_loop(
    mut state: DeviceState,
    width: u32,
    height: u32,
    slot: FrameSlot,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) {
    use v4l::io::traits::CaptureStream;

    while running.load(Ordering::Acquire) {
        let frame = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))
            .and_then(|pixels| to_image(&pixels, width, height, PixelFormat::Rgb24));
        let published = frame.and_then(|image| slot.publish(image));
        if let Err(err) = published {
            log::error!("V4l2Source: {:#}", err);
            failed.store(true, Ordering::Release);
            break;
        }
    }
}

impl V4l2Source {
    pub const TYPE_NAME: &'static str = "v4l2";

    pub fn new(device_id: &str) -> Self {
        Self {
            settings: CaptureSettings {
                device_id: device_id.to_string(),
                ..CaptureSettings::default()
            },
            slot: FrameSlot::new(),
            current: None,
            frame_new: false,
            worker: None,
        }
    }

    /// Spawn the capture thread and wait until it opened the device.
    fn spawn_worker(&mut self) -> Result<()> {
        let (init_tx, init_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));
        let settings = self.settings.clone();
        let slot = self.slot.clone();
        let (flag, fail_flag) = (Arc::clone(&running), Arc::clone(&failed));

        let handle = thread::Builder::new()
            .name(format!("v4l2-{}", settings.device_id))
            .spawn(move || match open_device(&settings) {
                Ok((state, width, height)) => {
                    if init_tx.send(Ok(())).is_err() {
                        return;
                    }
                    drop(init_tx);
                    capture_loop(state, width, height, slot, flag, fail_flag);
                }
                Err(err) => {
                    let _ = init_tx.send(Err(format!("{:#}", err)));
                }
            })
            .context("spawn v4l2 capture thread")?;

        match init_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker {
                    running,
                    failed,
                    handle,
                });
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = handle.join();
                Err(anyhow!(message))
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                Err(anyhow!(
                    "v4l2 device {} did not open within {:?}",
                    self.settings.device_id,
                    OPEN_TIMEOUT
                ))
            }
        }
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            if worker.handle.join().is_err() {
                log::error!("V4l2Source: capture thread panicked");
            }
        }
    }
}

impl InputSource for V4l2Source {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    fn setup(&mut self, settings: &CaptureSettings) -> Result<()> {
        let restart = self.worker.is_some();
        self.stop_worker();
        self.settings = settings.clone();
        if restart {
            self.spawn_worker()?;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.spawn_worker()
    }

    fn update(&mut self) -> Result<()> {
        match self.slot.take_new()? {
            Some(frame) => {
                self.current = Some(frame);
                self.frame_new = true;
            }
            None => self.frame_new = false,
        }
        Ok(())
    }

    fn is_frame_new(&self) -> bool {
        self.frame_new
    }

    fn pixels(&self) -> Option<&DynamicImage> {
        self.current.as_ref()
    }

    fn close(&mut self) {
        self.stop_worker();
        self.frame_new = false;
    }

    fn is_healthy(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.failed.load(Ordering::Acquire))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.slot.published(),
            device_id: self.settings.device_id.clone(),
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
