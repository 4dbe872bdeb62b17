//! Structured loader configuration and its display-safe rendering.

use super::request::ComputeDType;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A config value as reported by a loader. Non-scalar tags such as dtypes
/// and paths are kept typed until `normalize` renders them.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DType(ComputeDType),
    Path(PathBuf),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

pub type ConfigSnapshot = BTreeMap<String, ConfigValue>;

impl ConfigValue {
    /// Render to plain JSON scalars, recursing through lists and maps.
    pub fn normalize(&self) -> Value {
        match self {
            ConfigValue::Null => Value::Null,
            ConfigValue::Bool(b) => Value::Bool(*b),
            ConfigValue::Int(i) => Value::Number((*i).into()),
            ConfigValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            ConfigValue::Str(s) => Value::String(s.clone()),
            ConfigValue::DType(dtype) => Value::String(dtype.as_str().to_string()),
            ConfigValue::Path(p) => Value::String(p.display().to_string()),
            ConfigValue::List(items) => Value::Array(items.iter().map(ConfigValue::normalize).collect()),
            ConfigValue::Map(entries) => Value::Object(normalize_snapshot(entries)),
        }
    }
}

pub fn normalize_snapshot(snapshot: &ConfigSnapshot) -> Map<String, Value> {
    snapshot
        .iter()
        .map(|(k, v)| (k.clone(), v.normalize()))
        .collect()
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<u32> for ConfigValue {
    fn from(v: u32) -> Self {
        ConfigValue::Int(v as i64)
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        ConfigValue::Int(v as i64)
    }
}

impl From<f32> for ConfigValue {
    fn from(v: f32) -> Self {
        ConfigValue::Float(v as f64)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Str(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Str(v)
    }
}

impl From<ComputeDType> for ConfigValue {
    fn from(v: ComputeDType) -> Self {
        ConfigValue::DType(v)
    }
}

impl From<PathBuf> for ConfigValue {
    fn from(v: PathBuf) -> Self {
        ConfigValue::Path(v)
    }
}

impl<T: Into<ConfigValue>> From<Option<T>> for ConfigValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ConfigValue::Null)
    }
}

impl<T: Into<ConfigValue>> From<Vec<T>> for ConfigValue {
    fn from(v: Vec<T>) -> Self {
        ConfigValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, String>> for ConfigValue {
    fn from(v: BTreeMap<String, String>) -> Self {
        ConfigValue::Map(v.into_iter().map(|(k, v)| (k, ConfigValue::Str(v))).collect())
    }
}
