//! Result notifications.
//!
//! Every notification point offers two delivery modes:
//! - **fast**: callbacks run on the capture thread and borrow the live
//!   buffer. The borrow ends with the call, so a callback cannot retain it.
//! - **safe**: subscribers receive an owned deep copy over a bounded channel.
//!   Each notification makes at most one copy that no subscriber takes.
//!
//! Safe subscribers that fall behind miss frames instead of stalling capture.
//! Subscribers whose receiver was dropped are pruned on the next delivery.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use image::DynamicImage;

/// Frames buffered per safe subscriber before new ones are dropped.
pub const SUBSCRIBER_CAPACITY: usize = 4;

/// Borrowed view of one stage's output, valid only during the callback.
pub struct StageOutput<'a> {
    pub chain: &'a str,
    pub stage: &'a str,
    pub image: &'a DynamicImage,
}

/// Owned copy of one stage's output.
#[derive(Clone, Debug)]
pub struct StageResult {
    pub chain: String,
    pub stage: String,
    pub image: DynamicImage,
}

/// Borrowed view of a completed cycle.
pub struct StreamOutput<'a> {
    pub stream: &'a str,
    pub result: &'a DynamicImage,
    pub input: &'a DynamicImage,
    pub fps: f32,
    pub frame_number: u64,
}

/// Owned copy of a completed cycle.
#[derive(Clone, Debug)]
pub struct StreamFrame {
    pub stream: String,
    pub result: DynamicImage,
    pub input: DynamicImage,
    pub fps: f32,
    pub frame_number: u64,
}

type StageCallback = Box<dyn Fn(&StageOutput<'_>) + Send>;
type StreamCallback = Box<dyn Fn(&StreamOutput<'_>) + Send>;

#[derive(Default)]
pub struct StageListeners {
    callbacks: Vec<StageCallback>,
    subscribers: Vec<Sender<StageResult>>,
}

impl StageListeners {
    pub fn on_output<F>(&mut self, callback: F)
    where
        F: Fn(&StageOutput<'_>) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    pub fn subscribe(&mut self) -> Receiver<StageResult> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    pub fn notify(&mut self, output: &StageOutput<'_>) {
        for callback in &self.callbacks {
            callback(output);
        }
        deliver(&mut self.subscribers, output.stage, || StageResult {
            chain: output.chain.to_string(),
            stage: output.stage.to_string(),
            image: output.image.clone(),
        });
    }
}

#[derive(Default)]
pub struct StreamListeners {
    callbacks: Vec<StreamCallback>,
    subscribers: Vec<Sender<StreamFrame>>,
}

impl StreamListeners {
    pub fn on_frame<F>(&mut self, callback: F)
    where
        F: Fn(&StreamOutput<'_>) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    pub fn subscribe(&mut self) -> Receiver<StreamFrame> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    pub fn notify(&mut self, output: &StreamOutput<'_>) {
        for callback in &self.callbacks {
            callback(output);
        }
        deliver(&mut self.subscribers, output.stream, || StreamFrame {
            stream: output.stream.to_string(),
            result: output.result.clone(),
            input: output.input.clone(),
            fps: output.fps,
            frame_number: output.frame_number,
        });
    }
}

fn deliver<T>(subscribers: &mut Vec<Sender<T>>, label: &str, make: impl Fn() -> T) {
    // A copy refused by one subscriber is offered to the next.
    let mut spare = None;
    subscribers.retain(|tx| match tx.try_send(spare.take().unwrap_or_else(&make)) {
        Ok(()) => true,
        Err(TrySendError::Full(item)) => {
            log::debug!("{}: subscriber is lagging, dropping result", label);
            spare = Some(item);
            true
        }
        Err(TrySendError::Disconnected(item)) => {
            spare = Some(item);
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fast_and_safe_delivery() {
        let mut listeners = StageListeners::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        listeners.on_output(move |output| {
            assert_eq!(output.stage, "threshold");
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let rx = listeners.subscribe();

        let image = DynamicImage::new_luma8(2, 2);
        listeners.notify(&StageOutput {
            chain: "main",
            stage: "threshold",
            image: &image,
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let result = rx.try_recv().expect("owned copy delivered");
        assert_eq!(result.chain, "main");
        assert_eq!(result.image.width(), 2);
    }

    #[test]
    fn dropped_subscribers_are_pruned_and_full_ones_kept() {
        let mut listeners = StreamListeners::default();
        let kept = listeners.subscribe();
        drop(listeners.subscribe());

        let image = DynamicImage::new_luma8(1, 1);
        for frame_number in 0..(SUBSCRIBER_CAPACITY as u64 + 2) {
            listeners.notify(&StreamOutput {
                stream: "s",
                result: &image,
                input: &image,
                fps: 0.0,
                frame_number,
            });
        }

        assert_eq!(listeners.subscribers.len(), 1);
        assert_eq!(kept.len(), SUBSCRIBER_CAPACITY);
        let first = kept.try_recv().expect("buffered frame");
        assert_eq!(first.frame_number, 0);
    }

    #[test]
    fn lagging_subscriber_is_pruned_once_dropped() {
        let mut listeners = StageListeners::default();
        let lagging = listeners.subscribe();
        let image = DynamicImage::new_luma8(1, 1);
        let output = StageOutput {
            chain: "main",
            stage: "threshold",
            image: &image,
        };
        for _ in 0..SUBSCRIBER_CAPACITY {
            listeners.notify(&output);
        }
        assert_eq!(lagging.len(), SUBSCRIBER_CAPACITY);

        listeners.notify(&output);
        assert_eq!(listeners.subscribers.len(), 1);

        drop(lagging);
        listeners.notify(&output);
        assert!(listeners.subscribers.is_empty());
    }
}
