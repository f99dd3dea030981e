//! Parameter tree exposed by stages and streams.
//!
//! The tree is the contract between the core and any outer surface (a
//! parameter GUI, a persistence file). Stages describe themselves as a
//! `ParameterGroup`; the chain assembles one group per attached stage.

use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// A single parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer view. Floats are accepted when they carry no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            ParamValue::Float(value) if value.fract() == 0.0 && value.is_finite() => {
                Some(*value as i64)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(value) => Some(*value as f64),
            ParamValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{}", value),
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Float(value) => write!(f, "{}", value),
            ParamValue::Text(value) => write!(f, "{}", value),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

/// Named value with an optional inclusive range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<ParamValue>,
}

impl Parameter {
    pub fn new(name: &str, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            min: None,
            max: None,
        }
    }

    pub fn with_range(mut self, min: impl Into<ParamValue>, max: impl Into<ParamValue>) -> Self {
        self.min = Some(min.into());
        self.max = Some(max.into());
        self
    }
}

/// Named, nestable collection of parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterGroup {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub groups: Vec<ParameterGroup>,
}

impl ParameterGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn add(&mut self, parameter: Parameter) {
        self.parameters.push(parameter);
    }

    pub fn add_group(&mut self, group: ParameterGroup) {
        self.groups.push(group);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.parameters
            .iter()
            .find(|param| param.name == name)
            .map(|param| &param.value)
    }

    pub fn group(&self, name: &str) -> Option<&ParameterGroup> {
        self.groups.iter().find(|group| group.name == name)
    }
}

// ----------------------------------------------------------------------------
// Value coercion helpers used by stage setters
// ----------------------------------------------------------------------------

pub(crate) fn expect_bool(name: &str, value: &ParamValue) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| anyhow!("parameter '{}' expects a boolean, got {}", name, value))
}

pub(crate) fn expect_int_in(name: &str, value: &ParamValue, min: i64, max: i64) -> Result<i64> {
    let parsed = value
        .as_i64()
        .ok_or_else(|| anyhow!("parameter '{}' expects an integer, got {}", name, value))?;
    if !(min..=max).contains(&parsed) {
        return Err(anyhow!(
            "parameter '{}' out of range: {} not in {}..={}",
            name,
            parsed,
            min,
            max
        ));
    }
    Ok(parsed)
}

pub(crate) fn expect_float_in(name: &str, value: &ParamValue, min: f64, max: f64) -> Result<f64> {
    let parsed = value
        .as_f64()
        .ok_or_else(|| anyhow!("parameter '{}' expects a number, got {}", name, value))?;
    if !parsed.is_finite() || parsed < min || parsed > max {
        return Err(anyhow!(
            "parameter '{}' out of range: {} not in {}..={}",
            name,
            parsed,
            min,
            max
        ));
    }
    Ok(parsed)
}
