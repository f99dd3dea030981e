use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::Receiver;
use image::{DynamicImage, GenericImageView, GrayImage};

use vidchain::ingest::SourceStats;
use vidchain::stage::{shared, ImageAdjustmentsStage, ThresholdStage};
use vidchain::{
    CaptureSettings, ChainEvent, FrameBundle, FrameFeeder, InputSource, ManualSource, Region,
    SharedStage, Stage, StageCore, StageResult, StreamFrame, StreamOptions, StreamState,
    VideoStream,
};

const WAIT: Duration = Duration::from_secs(5);

fn manual_stream(width: u32, height: u32) -> Result<(VideoStream, FrameFeeder)> {
    let stream = VideoStream::new(
        StreamOptions::named("scenario").with_processing_size(width, height),
    )?;
    let source = ManualSource::new("feed");
    let feeder = source.feeder();
    stream.replace_input_source(Box::new(source))?;
    Ok((stream, feeder))
}

fn gray(width: u32, height: u32, pixels: Vec<u8>) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, pixels).expect("gray frame"))
}

fn subscribe_stage(stage: &SharedStage) -> Receiver<StageResult> {
    stage
        .lock()
        .expect("stage lock")
        .core_mut()
        .listeners_mut()
        .subscribe()
}

fn next_frame(frames: &Receiver<StreamFrame>) -> StreamFrame {
    frames.recv_timeout(WAIT).expect("stream frame")
}

/// Source whose device never opens.
struct UnpluggedSource {
    settings: CaptureSettings,
}

impl UnpluggedSource {
    fn new() -> Self {
        Self {
            settings: CaptureSettings {
                device_id: "/dev/video9".to_string(),
                ..CaptureSettings::default()
            },
        }
    }
}

impl InputSource for UnpluggedSource {
    fn type_name(&self) -> &'static str {
        "unplugged"
    }

    fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    fn setup(&mut self, _settings: &CaptureSettings) -> Result<()> {
        Err(anyhow!("no such device"))
    }

    fn start(&mut self) -> Result<()> {
        Err(anyhow!("no such device"))
    }

    fn update(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_frame_new(&self) -> bool {
        false
    }

    fn pixels(&self) -> Option<&DynamicImage> {
        None
    }

    fn close(&mut self) {}

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}

/// Source that hangs inside its first `update()` and records which
/// threads poll it.
struct StallingSource {
    settings: CaptureSettings,
    stall: Duration,
    stalled: bool,
    pollers: Arc<Mutex<HashSet<ThreadId>>>,
}

impl InputSource for StallingSource {
    fn type_name(&self) -> &'static str {
        "stalling"
    }

    fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    fn setup(&mut self, _settings: &CaptureSettings) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.pollers
            .lock()
            .expect("pollers lock")
            .insert(thread::current().id());
        if !self.stalled {
            self.stalled = true;
            thread::sleep(self.stall);
        }
        Ok(())
    }

    fn is_frame_new(&self) -> bool {
        false
    }

    fn pixels(&self) -> Option<&DynamicImage> {
        None
    }

    fn close(&mut self) {}

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}

/// Stage whose `process` always fails.
struct BrokenStage {
    core: StageCore,
}

impl Stage for BrokenStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn type_name(&self) -> &'static str {
        "broken"
    }

    fn process(&mut self, _frame: &mut FrameBundle) -> Result<()> {
        Err(anyhow!("kernel exploded"))
    }
}

#[test]
fn single_threshold_stage_publishes_binary_result() -> Result<()> {
    let (stream, feeder) = manual_stream(2, 2)?;
    stream.add_stage(shared(ThresholdStage::with_level(127)), None)?;
    let frames = stream.subscribe_frames()?;
    stream.start()?;

    feeder.push(gray(2, 2, vec![0, 255, 0, 255]))?;
    let frame = next_frame(&frames);

    assert_eq!(frame.stream, "scenario");
    assert_eq!(frame.result.dimensions(), (2, 2));
    assert_eq!(frame.result.to_luma8().into_raw(), vec![0, 255, 0, 255]);
    assert_eq!(frame.input.to_luma8().into_raw(), vec![0, 255, 0, 255]);
    assert_eq!(frame.frame_number, 1);

    let latest = stream.latest_frame().expect("latest frame");
    assert_eq!(latest.frame_number, 1);
    stream.close()
}

#[test]
fn inactive_stage_is_skipped_and_silent() -> Result<()> {
    let (stream, feeder) = manual_stream(3, 1)?;
    let first = shared(ThresholdStage::with_level(40));
    let second = shared(ImageAdjustmentsStage::new());
    stream.add_stage(Arc::clone(&first), None)?;
    stream.add_stage(Arc::clone(&second), None)?;
    stream.set_stage_parameter(1usize, "brightness", 0.5)?;
    stream.set_stage_active("image_adjustments", false)?;

    let first_outputs = subscribe_stage(&first);
    let second_outputs = subscribe_stage(&second);
    let frames = stream.subscribe_frames()?;
    stream.start()?;

    feeder.push(gray(3, 1, vec![10, 41, 200]))?;
    let frame = next_frame(&frames);
    let stage_output = first_outputs.recv_timeout(WAIT).expect("first stage output");

    assert_eq!(stage_output.stage, "threshold");
    assert_eq!(stage_output.chain, "scenario");
    assert_eq!(stage_output.image.as_bytes(), &[0, 255, 255]);
    assert_eq!(frame.result.as_bytes(), stage_output.image.as_bytes());
    assert!(second_outputs.try_recv().is_err());
    stream.close()
}

#[test]
fn stage_notifications_precede_stream_notification() -> Result<()> {
    let (stream, feeder) = manual_stream(2, 1)?;
    let order = Arc::new(Mutex::new(Vec::new()));
    for level in [10u8, 20] {
        let stage = shared(ThresholdStage::with_level(level));
        let log = Arc::clone(&order);
        stage
            .lock()
            .expect("stage lock")
            .core_mut()
            .listeners_mut()
            .on_output(move |output| {
                log.lock().expect("order lock").push(output.stage.to_string());
            });
        stream.add_stage(stage, None)?;
    }
    let log = Arc::clone(&order);
    stream.on_frame(move |output| {
        log.lock()
            .expect("order lock")
            .push(format!("stream:{}", output.frame_number));
    })?;
    let frames = stream.subscribe_frames()?;
    stream.start()?;

    feeder.push(gray(2, 1, vec![5, 15]))?;
    let frame = next_frame(&frames);
    stream.stop()?;

    assert_eq!(frame.result.as_bytes(), &[0, 255]);
    let order = order.lock().expect("order lock").clone();
    assert_eq!(order, vec!["threshold", "threshold_2", "stream:1"]);
    stream.close()
}

#[test]
fn resize_while_running_switches_dimensions_once() -> Result<()> {
    let (stream, feeder) = manual_stream(4, 4)?;
    stream.add_stage(shared(ThresholdStage::new()), None)?;
    let frames = stream.subscribe_frames()?;
    stream.start()?;

    let pushing = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&pushing);
    let producer = thread::spawn(move || -> Result<()> {
        let mut value = 0u8;
        while flag.load(Ordering::Acquire) {
            feeder.push(gray(4, 4, vec![value; 16]))?;
            value = value.wrapping_add(37);
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    });

    let _ = next_frame(&frames);
    stream.set_processing_size(2, 2)?;

    let mut seen_new = false;
    let deadline = Instant::now() + WAIT;
    let mut after_switch = 0;
    while after_switch < 5 && Instant::now() < deadline {
        let frame = next_frame(&frames);
        match frame.result.dimensions() {
            (4, 4) => assert!(!seen_new, "old size published after the new one"),
            (2, 2) => {
                seen_new = true;
                after_switch += 1;
            }
            other => panic!("unexpected result size {:?}", other),
        }
    }

    pushing.store(false, Ordering::Release);
    producer.join().expect("producer thread")?;
    assert!(seen_new);
    assert_eq!(stream.transform()?.size(), (2, 2));
    stream.close()
}

#[test]
fn close_is_idempotent_and_final() -> Result<()> {
    let (stream, feeder) = manual_stream(2, 2)?;
    let frames = stream.subscribe_frames()?;
    stream.start()?;
    feeder.push(gray(2, 2, vec![1, 2, 3, 4]))?;
    let _ = next_frame(&frames);

    stream.close()?;
    stream.close()?;
    assert_eq!(stream.state(), StreamState::Closed);
    assert!(!stream.has_source()?);
    assert!(stream.start().is_err());
    Ok(())
}

#[test]
fn stop_then_start_resumes_publishing() -> Result<()> {
    let (stream, feeder) = manual_stream(2, 2)?;
    let frames = stream.subscribe_frames()?;
    stream.start()?;
    feeder.push(gray(2, 2, vec![9; 4]))?;
    let _ = next_frame(&frames);

    stream.stop()?;
    assert_eq!(stream.state(), StreamState::Stopped);
    stream.start()?;
    feeder.push(gray(2, 2, vec![7; 4]))?;
    let frame = next_frame(&frames);
    assert_eq!(frame.result.as_bytes(), &[7; 4]);
    assert_eq!(frame.frame_number, 2);
    stream.close()
}

#[test]
fn fast_callbacks_see_every_cycle() -> Result<()> {
    let (stream, feeder) = manual_stream(1, 1)?;
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    stream.on_frame(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    })?;
    stream.start()?;

    let deadline = Instant::now() + WAIT;
    let mut pushed = 0;
    while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        if count.load(Ordering::SeqCst) == pushed {
            feeder.push(gray(1, 1, vec![pushed as u8]))?;
            pushed += 1;
        }
        thread::sleep(Duration::from_millis(5));
    }
    stream.close()?;
    assert!(count.load(Ordering::SeqCst) >= 3);
    Ok(())
}

#[test]
fn chain_events_follow_running_edits() -> Result<()> {
    let (stream, _feeder) = manual_stream(2, 2)?;
    let events = stream.subscribe_chain_events()?;
    stream.start()?;

    stream.add_stage_by_type("threshold")?;
    stream.add_stage_by_type("threshold")?;
    stream.swap_stages(0, 1)?;
    stream.remove_stage("threshold")?;

    let mut received = Vec::new();
    while received.len() < 4 {
        received.push(events.recv_timeout(WAIT).expect("chain event"));
    }
    stream.close()?;

    assert_eq!(
        received,
        vec![
            ChainEvent::StageAdded {
                name: "threshold".to_string(),
                index: 0
            },
            ChainEvent::StageAdded {
                name: "threshold_2".to_string(),
                index: 1
            },
            ChainEvent::OrderChanged { first: 0, second: 1 },
            ChainEvent::StageRemoved {
                name: "threshold".to_string(),
                index: 1
            },
        ]
    );
    assert_eq!(stream.stage_names()?, vec!["threshold_2"]);
    Ok(())
}

#[test]
fn roi_mode_stretches_the_roi_over_the_frame() -> Result<()> {
    let (stream, feeder) = manual_stream(4, 4)?;
    stream.set_roi(Region::rectangle(0.0, 0.0, 2.0, 2.0))?;
    stream.set_use_roi(true)?;
    let frames = stream.subscribe_frames()?;
    stream.start()?;

    #[rustfmt::skip]
    let pixels = vec![
        200, 200, 10, 10,
        200, 200, 10, 10,
        10,  10,  10, 10,
        10,  10,  10, 10,
    ];
    feeder.push(gray(4, 4, pixels.clone()))?;
    let frame = next_frame(&frames);
    stream.close()?;

    let result = frame.result.as_bytes();
    assert_eq!(frame.result.dimensions(), (4, 4));
    assert_eq!(&result[..3], &[200, 200, 200]);
    assert!((100..=110).contains(&result[3]), "edge pixel {}", result[3]);
    assert_eq!(result[4], 200);
    assert_eq!(result[8], 200);
    assert_eq!(frame.input.as_bytes(), pixels.as_slice());
    Ok(())
}

#[test]
fn failing_stage_is_skipped_and_silent() -> Result<()> {
    let (stream, feeder) = manual_stream(2, 1)?;
    let before = shared(ThresholdStage::with_level(100));
    let broken = shared(BrokenStage {
        core: StageCore::new("broken"),
    });
    let after = shared(ThresholdStage::with_level(100));
    stream.add_stage(Arc::clone(&before), None)?;
    stream.add_stage(Arc::clone(&broken), None)?;
    stream.add_stage(Arc::clone(&after), None)?;

    let broken_outputs = subscribe_stage(&broken);
    let after_outputs = subscribe_stage(&after);
    let frames = stream.subscribe_frames()?;
    stream.start()?;

    feeder.push(gray(2, 1, vec![50, 150]))?;
    let frame = next_frame(&frames);
    let last = after_outputs.recv_timeout(WAIT).expect("stage after the failure");
    stream.close()?;

    assert!(broken_outputs.try_recv().is_err());
    assert_eq!(last.stage, "threshold_2");
    assert_eq!(frame.result.as_bytes(), &[0, 255]);
    Ok(())
}

#[test]
fn source_that_fails_to_open_keeps_the_stream_stopped() -> Result<()> {
    let stream = VideoStream::new(StreamOptions::named("unplugged"))?;
    stream.replace_input_source(Box::new(UnpluggedSource::new()))?;

    assert!(stream.start().is_err());
    assert_eq!(stream.state(), StreamState::Stopped);
    assert!(!stream.is_configured()?);
    assert!(stream.has_source()?);
    Ok(())
}

#[test]
fn failed_source_swap_while_running_keeps_the_old_source() -> Result<()> {
    let (stream, feeder) = manual_stream(2, 2)?;
    let frames = stream.subscribe_frames()?;
    stream.start()?;

    assert!(stream
        .replace_input_source(Box::new(UnpluggedSource::new()))
        .is_err());
    assert_eq!(stream.state(), StreamState::Running);
    assert!(stream.has_source()?);
    let source = stream.descriptor()?.source.expect("source kept");
    assert_eq!(source.type_name, "manual");
    assert_eq!(source.settings.device_id, "feed");

    feeder.push(gray(2, 2, vec![3; 4]))?;
    let frame = next_frame(&frames);
    assert_eq!(frame.result.as_bytes(), &[3; 4]);
    stream.close()
}

#[test]
fn detached_capture_thread_exits_after_restart() -> Result<()> {
    let stream = VideoStream::new(StreamOptions {
        poll_interval: Duration::from_millis(400),
        stop_timeout: Duration::from_millis(100),
        ..StreamOptions::named("stall")
    })?;
    let pollers = Arc::new(Mutex::new(HashSet::new()));
    stream.replace_input_source(Box::new(StallingSource {
        settings: CaptureSettings::default(),
        stall: Duration::from_millis(300),
        stalled: false,
        pollers: Arc::clone(&pollers),
    }))?;

    stream.start()?;
    thread::sleep(Duration::from_millis(50));
    // Times out while the first poll hangs, detaching that thread.
    stream.stop()?;
    stream.start()?;
    pollers.lock().expect("pollers lock").clear();

    thread::sleep(Duration::from_millis(1500));
    let polled_after_restart = pollers.lock().expect("pollers lock").len();
    stream.close()?;
    assert_eq!(polled_after_restart, 1);
    Ok(())
}
