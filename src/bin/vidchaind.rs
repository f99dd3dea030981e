//! vidchaind - run one processing stream from the command line
//!
//! The daemon:
//! 1. Loads configuration (file named by VIDCHAIN_CONFIG, then VIDCHAIN_* overrides)
//! 2. Opens the configured input source
//! 3. Builds the stage chain from a stream descriptor and/or --stage flags
//! 4. Runs until Ctrl-C or until --frames results were published
//! 5. Optionally writes the last result and the final descriptor to disk

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use vidchain::config::DaemonConfig;
use vidchain::ingest::{InputSource, SyntheticSource};
use vidchain::{StreamDescriptor, VideoStream};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run a live video stream through a chain of processing stages"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "VIDCHAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Stream descriptor to apply at startup. Overrides `stages_path` from
    /// the config file.
    #[arg(long)]
    stages: Option<PathBuf>,

    /// Append a stage by type name. May be repeated.
    #[arg(long = "stage", value_name = "TYPE")]
    extra_stages: Vec<String>,

    /// Exit after this many published frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Write the last result image here on exit (JPEG).
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Write the stream descriptor here on exit.
    #[arg(long)]
    dump_descriptor: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = DaemonConfig::load_from(args.config.as_deref())?;
    let stream = VideoStream::new(cfg.stream_options())?;
    stream.set_mirror(cfg.mirror, cfg.flip)?;
    open_source(&stream, &cfg)?;

    if let Some(path) = args.stages.as_ref().or(cfg.stages_path.as_ref()) {
        let mut descriptor = StreamDescriptor::load(path)?;
        // The configured source wins over the one recorded in the descriptor.
        descriptor.source = None;
        stream.apply_descriptor(&descriptor)?;
        log::info!("applied stream descriptor {}", path.display());
    }
    for type_name in &args.extra_stages {
        stream.add_stage_by_type(type_name)?;
    }
    log::info!("stages: {:?}", stream.stage_names()?);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let frames = stream.subscribe_frames()?;
    stream.start()?;
    log::info!("{} running. waiting for shutdown signal (Ctrl-C)...", stream.name());

    let mut received = 0u64;
    let mut last_report = Instant::now();
    loop {
        if rx.try_recv().is_ok() {
            log::info!("shutdown signal received, stopping stream...");
            break;
        }
        match frames.recv_timeout(Duration::from_millis(200)) {
            Ok(_) => received += 1,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if args.frames.is_some_and(|limit| received >= limit) {
            log::info!("received {} frames, stopping stream...", received);
            break;
        }
        if last_report.elapsed() >= cfg.stats_interval {
            log::info!(
                "{}: {} frames received, {:.1} fps",
                stream.name(),
                received,
                stream.fps()?
            );
            last_report = Instant::now();
        }
    }

    stream.stop()?;
    if let Some(path) = &args.snapshot {
        match stream.latest_frame() {
            Some(frame) => {
                frame
                    .result
                    .to_rgb8()
                    .save(path)
                    .with_context(|| format!("write snapshot {}", path.display()))?;
                log::info!("wrote frame {} to {}", frame.frame_number, path.display());
            }
            None => log::warn!("no frame was published, snapshot skipped"),
        }
    }
    if let Some(path) = &args.dump_descriptor {
        stream.descriptor()?.save(path)?;
        log::info!("wrote stream descriptor to {}", path.display());
    }
    stream.close()
}

fn open_source(stream: &VideoStream, cfg: &DaemonConfig) -> Result<()> {
    let descriptor = cfg.source_descriptor();
    if descriptor.type_name == SyntheticSource::TYPE_NAME && cfg.source.noise > 0 {
        let mut source = SyntheticSource::new(&descriptor.settings.device_id)
            .with_noise(cfg.source.noise);
        source.setup(&descriptor.settings)?;
        return stream.replace_input_source(Box::new(source));
    }
    stream.set_input_source(descriptor)
}
