use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::{
    CaptureSettings, SyntheticSource, DEFAULT_CAPTURE_FPS, DEFAULT_CAPTURE_HEIGHT,
    DEFAULT_CAPTURE_WIDTH,
};
use crate::persist::SourceDescriptor;
use crate::stream::{StreamOptions, DEFAULT_PROCESS_HEIGHT, DEFAULT_PROCESS_WIDTH};

const DEFAULT_STREAM_NAME: &str = "main";
const DEFAULT_DEVICE_ID: &str = "0";
const DEFAULT_STATS_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct DaemonConfigFile {
    name: Option<String>,
    source: Option<SourceConfigFile>,
    processing: Option<ProcessingConfigFile>,
    stages_path: Option<PathBuf>,
    stats: Option<StatsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    #[serde(rename = "type")]
    type_name: Option<String>,
    device_id: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    noise: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessingConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    mirror: Option<bool>,
    flip: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct StatsConfigFile {
    seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub name: String,
    pub source: SourceSettings,
    pub processing_width: u32,
    pub processing_height: u32,
    pub mirror: bool,
    pub flip: bool,
    /// Stream descriptor to apply at startup.
    pub stages_path: Option<PathBuf>,
    pub stats_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub type_name: String,
    pub device_id: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Per-pixel jitter for the synthetic source.
    pub noise: u8,
}

impl DaemonConfig {
    /// Defaults, overlaid with the file named by `VIDCHAIN_CONFIG` and then
    /// with `VIDCHAIN_*` environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIDCHAIN_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let processing = file.processing.unwrap_or_default();
        Self {
            name: file.name.unwrap_or_else(|| DEFAULT_STREAM_NAME.to_string()),
            source: SourceSettings {
                type_name: source
                    .type_name
                    .unwrap_or_else(|| SyntheticSource::TYPE_NAME.to_string()),
                device_id: source
                    .device_id
                    .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
                width: source.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                fps: source.fps.unwrap_or(DEFAULT_CAPTURE_FPS),
                noise: source.noise.unwrap_or(0),
            },
            processing_width: processing.width.unwrap_or(DEFAULT_PROCESS_WIDTH),
            processing_height: processing.height.unwrap_or(DEFAULT_PROCESS_HEIGHT),
            mirror: processing.mirror.unwrap_or(false),
            flip: processing.flip.unwrap_or(false),
            stages_path: file.stages_path,
            stats_interval: Duration::from_secs(
                file.stats
                    .and_then(|stats| stats.seconds)
                    .unwrap_or(DEFAULT_STATS_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(kind) = std::env::var("VIDCHAIN_SOURCE_TYPE") {
            if !kind.trim().is_empty() {
                self.source.type_name = kind.trim().to_string();
            }
        }
        if let Ok(device) = std::env::var("VIDCHAIN_DEVICE_ID") {
            if !device.trim().is_empty() {
                self.source.device_id = device.trim().to_string();
            }
        }
        if let Ok(width) = std::env::var("VIDCHAIN_PROCESS_WIDTH") {
            self.processing_width = parse_env("VIDCHAIN_PROCESS_WIDTH", &width)?;
        }
        if let Ok(height) = std::env::var("VIDCHAIN_PROCESS_HEIGHT") {
            self.processing_height = parse_env("VIDCHAIN_PROCESS_HEIGHT", &height)?;
        }
        if let Ok(secs) = std::env::var("VIDCHAIN_STATS_SECS") {
            self.stats_interval = Duration::from_secs(parse_env("VIDCHAIN_STATS_SECS", &secs)?);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("stream name must not be empty"));
        }
        if self.processing_width == 0 || self.processing_height == 0 {
            return Err(anyhow!(
                "processing size must be non-zero, got {}x{}",
                self.processing_width,
                self.processing_height
            ));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("capture size must be non-zero"));
        }
        if self.stats_interval.as_secs() == 0 {
            return Err(anyhow!("stats interval must be greater than zero"));
        }
        Ok(())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions::named(&self.name)
            .with_processing_size(self.processing_width, self.processing_height)
    }

    pub fn source_descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            type_name: self.source.type_name.clone(),
            settings: CaptureSettings {
                width: self.source.width,
                height: self.source.height,
                fps: self.source.fps,
                device_id: self.source.device_id.clone(),
            },
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be a non-negative integer, got '{}'", key, value))
}

/// JSON, or TOML when the extension is `.toml`.
fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
