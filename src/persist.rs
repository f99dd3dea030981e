//! Structural configuration tree.
//!
//! A `StreamDescriptor` captures everything needed to rebuild a stream:
//! geometry, regions, the input source, and the ordered stages with their
//! names, activation and parameters. Stage and source types are stored by
//! registry name and resolved again when the descriptor is applied.
//!
//! Descriptors are stored as JSON, or TOML when the file extension is
//! `.toml`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ingest::CaptureSettings;
use crate::params::Parameter;
use crate::registry::StageRegistry;
use crate::stage::{SharedStage, Stage, ACTIVE_KEY, TYPE_KEY};
use crate::transform::Region;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub type_name: String,
    #[serde(flatten)]
    pub settings: CaptureSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub type_name: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

fn default_active() -> bool {
    true
}

impl StageDescriptor {
    pub fn from_stage(stage: &dyn Stage) -> Self {
        Self {
            type_name: stage.type_name().to_string(),
            name: stage.name().to_string(),
            active: stage.is_active(),
            parameters: stage.parameters(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub flip: bool,
    pub processing_width: u32,
    pub processing_height: u32,
    #[serde(default)]
    pub use_roi: bool,
    #[serde(default)]
    pub roi: Region,
    /// Empty means the processing rectangle.
    #[serde(default)]
    pub output_region: Region,
    #[serde(default)]
    pub source: Option<SourceDescriptor>,
    #[serde(default)]
    pub stages: Vec<StageDescriptor>,
}

impl StreamDescriptor {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| anyhow!("invalid stream descriptor: {}", e))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize stream descriptor")
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| anyhow!("invalid stream descriptor: {}", e))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize stream descriptor")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read descriptor {}: {}", path.display(), e))?;
        if is_toml(path) {
            Self::from_toml(&raw)
        } else {
            Self::from_json(&raw)
        }
        .with_context(|| format!("load {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = if is_toml(path) {
            self.to_toml()?
        } else {
            self.to_json()?
        };
        std::fs::write(path, raw)
            .map_err(|e| anyhow!("failed to write descriptor {}: {}", path.display(), e))
    }

    /// Instantiate the described stages. Unknown types are logged and
    /// skipped; parameter errors are logged and the stage is kept.
    pub fn build_stages(&self, registry: &StageRegistry) -> Vec<SharedStage> {
        let mut stages = Vec::with_capacity(self.stages.len());
        for descriptor in &self.stages {
            let Some(stage) = registry.create(&descriptor.type_name, ()) else {
                log::error!(
                    "{}: could not find stage type '{}' for '{}', skipping",
                    self.name,
                    descriptor.type_name,
                    descriptor.name
                );
                continue;
            };
            match stage.lock() {
                Ok(mut guard) => {
                    guard.set_name(&descriptor.name);
                    guard.set_active(descriptor.active);
                    let parameters: Vec<Parameter> = descriptor
                        .parameters
                        .iter()
                        .filter(|p| p.name != TYPE_KEY && p.name != ACTIVE_KEY)
                        .cloned()
                        .collect();
                    if let Err(err) = guard.apply_parameters(&parameters) {
                        log::warn!("{}: stage '{}': {:#}", self.name, descriptor.name, err);
                    }
                }
                Err(_) => {
                    log::error!("{}: stage lock poisoned while restoring", self.name);
                    continue;
                }
            }
            stages.push(stage);
        }
        stages
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor {
            name: "main".to_string(),
            mirror: true,
            flip: false,
            processing_width: 160,
            processing_height: 120,
            use_roi: true,
            roi: Region::rectangle(10.0, 10.0, 100.0, 80.0),
            output_region: Region::default(),
            source: Some(SourceDescriptor {
                type_name: "synthetic".to_string(),
                settings: CaptureSettings::default(),
            }),
            stages: vec![
                StageDescriptor {
                    type_name: "threshold".to_string(),
                    name: "threshold".to_string(),
                    active: true,
                    parameters: vec![Parameter::new("level", 90i64)],
                },
                StageDescriptor {
                    type_name: "no_such_stage".to_string(),
                    name: "ghost".to_string(),
                    active: true,
                    parameters: Vec::new(),
                },
                StageDescriptor {
                    type_name: "morphology".to_string(),
                    name: "morphology_3".to_string(),
                    active: false,
                    parameters: vec![Parameter::new("kernel_size", 99i64)],
                },
            ],
        }
    }

    #[test]
    fn json_and_toml_agree() -> Result<()> {
        let original = descriptor();
        let from_json = StreamDescriptor::from_json(&original.to_json()?)?;
        let from_toml = StreamDescriptor::from_toml(&original.to_toml()?)?;
        assert_eq!(from_json, original);
        assert_eq!(from_toml, original);
        Ok(())
    }

    #[test]
    fn unknown_stage_types_are_skipped() -> Result<()> {
        let registry = StageRegistry::with_builtin_stages();
        let stages = descriptor().build_stages(&registry);
        assert_eq!(stages.len(), 2);

        let first = stages[0].lock().expect("stage lock");
        assert_eq!(first.name(), "threshold");
        assert_eq!(first.describe().get("level"), Some(&ParamValue::Int(90)));

        // Out-of-range parameters are reported but the stage survives.
        let second = stages[1].lock().expect("stage lock");
        assert_eq!(second.name(), "morphology_3");
        assert!(!second.is_active());
        assert_eq!(second.describe().get("kernel_size"), Some(&ParamValue::Int(1)));
        Ok(())
    }

    #[test]
    fn minimal_descriptor_uses_defaults() -> Result<()> {
        let parsed = StreamDescriptor::from_json(
            r#"{"name":"s","processing_width":4,"processing_height":2,
                "stages":[{"type_name":"threshold","name":"t"}]}"#,
        )?;
        assert!(!parsed.use_roi);
        assert!(parsed.roi.is_empty());
        assert!(parsed.source.is_none());
        assert!(parsed.stages[0].active);
        Ok(())
    }
}
