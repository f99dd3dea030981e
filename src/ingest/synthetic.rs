//! Synthetic frame source.
//!
//! Generates a moving RGB gradient on its own capture thread at the
//! configured frame rate. Optional noise makes consecutive frames differ
//! the way a real sensor's do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use image::DynamicImage;
use rand::Rng;

use super::normalize::{to_image, PixelFormat};
use super::{CaptureSettings, FrameSlot, InputSource, SourceStats, DEFAULT_CAPTURE_FPS};

pub struct SyntheticSource {
    settings: CaptureSettings,
    noise: u8,
    slot: FrameSlot,
    current: Option<DynamicImage>,
    frame_new: bool,
    frames_seen: u64,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SyntheticSource {
    pub const TYPE_NAME: &'static str = "synthetic";

    pub fn new(device_id: &str) -> Self {
        Self {
            settings: CaptureSettings {
                device_id: device_id.to_string(),
                ..CaptureSettings::default()
            },
            noise: 0,
            slot: FrameSlot::new(),
            current: None,
            frame_new: false,
            frames_seen: 0,
            worker: None,
        }
    }

    /// Add uniform noise of +/- `amplitude` to every channel.
    pub fn with_noise(mut self, amplitude: u8) -> Self {
        self.noise = amplitude;
        self
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let slot = self.slot.clone();
        let settings = self.settings.clone();
        let noise = self.noise;
        let handle = thread::Builder::new()
            .name(format!("synthetic-{}", settings.device_id))
            .spawn(move || capture_loop(settings, noise, slot, flag))
            .context("spawn synthetic capture thread")?;
        self.worker = Some(CaptureWorker { running, handle });
        log::info!(
            "SyntheticSource: connected to {} ({}x{} @ {} fps)",
            self.settings.device_id,
            self.settings.width,
            self.settings.height,
            self.settings.fps
        );
        Ok(())
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            if worker.handle.join().is_err() {
                log::error!("SyntheticSource: capture thread panicked");
            }
        }
    }
}

fn frame_interval(fps: u32) -> Duration {
    let fps = if fps == 0 { DEFAULT_CAPTURE_FPS } else { fps };
    Duration::from_millis(1000 / fps as u64)
}

fn capture_loop(settings: CaptureSettings, noise: u8, slot: FrameSlot, running: Arc<AtomicBool>) {
    let mut rng = rand::thread_rng();
    let mut frame_count = 0u64;
    let mut scene_state = 0u8;
    let interval = frame_interval(settings.fps);

    while running.load(Ordering::Acquire) {
        frame_count += 1;
        // Shift the scene now and then so downstream stages see change.
        if frame_count % 50 == 0 {
            scene_state = scene_state.wrapping_add(1);
        }

        let pixel_count = (settings.width * settings.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            let base = ((i as u64 / 3 + frame_count + scene_state as u64) % 256) as i16;
            let jitter = if noise > 0 {
                rng.gen_range(-(noise as i16)..=noise as i16)
            } else {
                0
            };
            *pixel = (base + jitter).clamp(0, 255) as u8;
        }

        match to_image(&pixels, settings.width, settings.height, PixelFormat::Rgb24) {
            Ok(frame) => {
                if let Err(err) = slot.publish(frame) {
                    log::error!("SyntheticSource: {}", err);
                    break;
                }
            }
            Err(err) => {
                log::error!("SyntheticSource: {}", err);
                break;
            }
        }
        thread::sleep(interval);
    }
}

impl InputSource for SyntheticSource {
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
                self.frames_seen += 1;
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
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.slot.published(),
            device_id: self.settings.device_id.clone(),
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for_frame(source: &mut SyntheticSource) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            source.update()?;
            if source.is_frame_new() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        anyhow::bail!("no frame within deadline")
    }

    #[test]
    fn synthetic_source_produces_frames() -> Result<()> {
        let mut source = SyntheticSource::new("stub").with_noise(4);
        source.setup(&CaptureSettings {
            width: 8,
            height: 6,
            fps: 100,
            device_id: "stub".to_string(),
        })?;
        source.start()?;
        wait_for_frame(&mut source)?;

        let frame = source.pixels().expect("frame");
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert!(source.is_healthy());

        source.close();
        assert!(!source.is_healthy());
        Ok(())
    }

    #[test]
    fn setup_while_running_restarts_with_new_size() -> Result<()> {
        let mut source = SyntheticSource::new("stub");
        source.start()?;
        source.setup(&CaptureSettings {
            width: 4,
            height: 4,
            fps: 100,
            device_id: "stub".to_string(),
        })?;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            wait_for_frame(&mut source)?;
            if source.pixels().map(|f| f.width()) == Some(4) {
                break;
            }
            assert!(Instant::now() < deadline, "resized frame never arrived");
        }
        source.close();
        Ok(())
    }
}
