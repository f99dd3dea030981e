//! Per-cycle frame data.
//!
//! - `FrameBundle`: the set of buffers a single capture cycle threads through
//!   the stage chain. A fresh bundle is built for every new frame.
//! - `FpsCounter`: rolling frame-rate measurement for the capture thread.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use image::{DynamicImage, GenericImageView, GrayImage};

/// Frame rate is measured over this trailing window.
const FPS_WINDOW: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// FrameBundle
// ----------------------------------------------------------------------------

/// Buffers shared by every stage during one cycle.
///
/// `source` is the untouched capture and is only reachable through a shared
/// reference. `stream` is the working buffer each stage reads and rewrites.
/// `result` holds the published output of the most recent stage; it starts
/// as a copy of `stream` so an empty chain publishes the prepared frame.
pub struct FrameBundle {
    source: DynamicImage,
    pub stream: DynamicImage,
    pub result: DynamicImage,
    /// Optional scratch mask written by segmentation-style stages.
    pub mask: Option<GrayImage>,
    /// Named auxiliary buffers stages may hand to later stages.
    pub user: HashMap<String, DynamicImage>,
}

impl FrameBundle {
    pub fn new(source: DynamicImage, stream: DynamicImage) -> Self {
        let result = stream.clone();
        Self {
            source,
            stream,
            result,
            mask: None,
            user: HashMap::new(),
        }
    }

    pub fn source(&self) -> &DynamicImage {
        &self.source
    }

    /// Dimensions of the working buffer.
    pub fn dimensions(&self) -> (u32, u32) {
        self.stream.dimensions()
    }

    /// Write a stage output to both `stream` and `result`.
    pub fn publish(&mut self, output: &DynamicImage) {
        self.stream = output.clone();
        self.result = output.clone();
    }

    /// Consume the bundle, returning `(source, result)`.
    pub fn into_parts(self) -> (DynamicImage, DynamicImage) {
        (self.source, self.result)
    }
}

// ----------------------------------------------------------------------------
// FpsCounter
// ----------------------------------------------------------------------------

/// Counts frames over a trailing one-second window.
#[derive(Debug, Default)]
pub struct FpsCounter {
    ticks: VecDeque<Instant>,
    total: u64,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub(crate) fn tick_at(&mut self, now: Instant) {
        while let Some(oldest) = self.ticks.front() {
            if now.duration_since(*oldest) > FPS_WINDOW {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
        self.ticks.push_back(now);
        self.total += 1;
    }

    /// Frames per second over the window, or 0 before two frames arrived.
    pub fn fps(&self) -> f32 {
        match (self.ticks.front(), self.ticks.back()) {
            (Some(first), Some(last)) if self.ticks.len() > 1 => {
                let span = last.duration_since(*first).as_secs_f32();
                if span > 0.0 {
                    (self.ticks.len() - 1) as f32 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Frames counted since creation.
    pub fn total(&self) -> u64 {
        self.total
    }
}
