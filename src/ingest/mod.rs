//! Frame ingestion sources.
//!
//! This module provides the sources a stream pulls frames from:
//! - Synthetic pattern generator (testing, demos)
//! - Manual source fed by the embedding application
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! A source may capture on its own thread. It then hands frames to the
//! stream through a `FrameSlot`, which only ever holds the most recent
//! completed frame. The stream polls with `update()` and reads the frame
//! with `pixels()`.
//!
//! Sources MUST NOT:
//! - Block `update()` waiting for a frame
//! - Log raw frame content

pub mod manual;
pub mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::registry::SourceRegistry;

pub use manual::{FrameFeeder, ManualSource};
pub use normalize::PixelFormat;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

pub const DEFAULT_CAPTURE_WIDTH: u32 = 320;
pub const DEFAULT_CAPTURE_HEIGHT: u32 = 240;
pub const DEFAULT_CAPTURE_FPS: u32 = 30;

/// Capture configuration handed to `InputSource::setup`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub device_id: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_CAPTURE_WIDTH,
            height: DEFAULT_CAPTURE_HEIGHT,
            fps: DEFAULT_CAPTURE_FPS,
            device_id: "0".to_string(),
        }
    }
}

/// Statistics for an input source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub device_id: String,
}

/// Camera-like frame producer.
///
/// Lifecycle: `setup` (may be repeated to change settings), `start`,
/// any number of `update` polls, `close`.
pub trait InputSource: Send {
    /// Registry name of the source type.
    fn type_name(&self) -> &'static str;

    fn settings(&self) -> &CaptureSettings;

    /// Apply capture settings. A running source restarts capture with them.
    fn setup(&mut self, settings: &CaptureSettings) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Poll for a newer frame. Never blocks waiting for one.
    fn update(&mut self) -> Result<()>;

    /// True when the last `update()` picked up a frame not seen before.
    fn is_frame_new(&self) -> bool;

    /// The most recent frame, if any has arrived.
    fn pixels(&self) -> Option<&DynamicImage>;

    /// Stop capturing and release the device. Idempotent.
    fn close(&mut self);

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

impl SourceRegistry {
    /// Registry pre-populated with every built-in source type. Factories
    /// take the device id.
    pub fn with_builtin_sources() -> Self {
        let mut registry = Self::new("source");
        registry.register(SyntheticSource::TYPE_NAME, |device_id: String| {
            Box::new(SyntheticSource::new(&device_id)) as Box<dyn InputSource>
        });
        registry.register(ManualSource::TYPE_NAME, |device_id: String| {
            Box::new(ManualSource::new(&device_id)) as Box<dyn InputSource>
        });
        #[cfg(feature = "ingest-v4l2")]
        registry.register(V4l2Source::TYPE_NAME, |device_id: String| {
            Box::new(V4l2Source::new(&device_id)) as Box<dyn InputSource>
        });
        registry
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: lock-protected single-frame hand-off
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    frame: Option<DynamicImage>,
    fresh: bool,
    published: u64,
}

/// Latest-frame hand-off between a capture thread and its source.
///
/// The producer overwrites the slot; the consumer takes the frame at most
/// once. Frames the consumer never saw are dropped.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<Mutex<SlotState>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: DynamicImage) -> Result<()> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| anyhow!("frame slot lock poisoned"))?;
        state.frame = Some(frame);
        state.fresh = true;
        state.published += 1;
        Ok(())
    }

    /// Take the frame if it arrived since the last call.
    pub fn take_new(&self) -> Result<Option<DynamicImage>> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| anyhow!("frame slot lock poisoned"))?;
        if !state.fresh {
            return Ok(None);
        }
        state.fresh = false;
        Ok(state.frame.take())
    }

    /// Frames published so far.
    pub fn published(&self) -> u64 {
        self.inner.lock().map(|state| state.published).unwrap_or(0)
    }
}
