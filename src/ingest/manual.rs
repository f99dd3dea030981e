//! Push-driven source.
//!
//! The embedding application (or a test) owns a `FrameFeeder` and pushes
//! frames whenever it has them. The stream picks up the latest one on its
//! next poll.

use anyhow::Result;
use image::DynamicImage;

use super::normalize::{to_image, PixelFormat};
use super::{CaptureSettings, FrameSlot, InputSource, SourceStats};

pub struct ManualSource {
    settings: CaptureSettings,
    slot: FrameSlot,
    current: Option<DynamicImage>,
    frame_new: bool,
    closed: bool,
}

/// Producer handle for a `ManualSource`. Cheap to clone.
#[derive(Clone)]
pub struct FrameFeeder {
    slot: FrameSlot,
}

impl FrameFeeder {
    pub fn push(&self, frame: DynamicImage) -> Result<()> {
        self.slot.publish(frame)
    }

    pub fn push_raw(&self, pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<()> {
        self.slot.publish(to_image(pixels, width, height, format)?)
    }
}

impl ManualSource {
    pub const TYPE_NAME: &'static str = "manual";

    pub fn new(device_id: &str) -> Self {
        Self {
            settings: CaptureSettings {
                device_id: device_id.to_string(),
                ..CaptureSettings::default()
            },
            slot: FrameSlot::new(),
            current: None,
            frame_new: false,
            closed: false,
        }
    }

    pub fn feeder(&self) -> FrameFeeder {
        FrameFeeder {
            slot: self.slot.clone(),
        }
    }
}

impl InputSource for ManualSource {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    fn setup(&mut self, settings: &CaptureSettings) -> Result<()> {
        self.settings = settings.clone();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.closed = false;
        log::info!("ManualSource: accepting frames for {}", self.settings.device_id);
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        if self.closed {
            self.frame_new = false;
            return Ok(());
        }
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
        self.closed = true;
        self.frame_new = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.slot.published(),
            device_id: self.settings.device_id.clone(),
        }
    }
}
