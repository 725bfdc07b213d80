//! Per-buildpack layer metadata.
//!
//! `BuildMetadata` maps buildpack ID to `BuildpackMetadata`, which maps
//! layer name to `LayerMetadata`. All maps are ordered so the serialized
//! form is stable for identical input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

/// Opaque layer configuration carried through from `<layer>.toml`.
///
/// The lifecycle never interprets the contents; it only converts between
/// the TOML sidecar file and the JSON metadata label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerData(serde_json::Value);

impl Default for LayerData {
    fn default() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl LayerData {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Parse sidecar TOML text. Empty text is empty data. Datetimes become
    /// their RFC 3339 strings.
    pub fn from_toml(text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text)
            .map_err(|e| LifecycleError::Malformed(format!("layer config: {}", e)))?;
        Ok(Self(toml_to_json(toml::Value::Table(table))))
    }

    /// Render as sidecar TOML text. Empty data renders as an empty string;
    /// `null` members are omitted since TOML has no null.
    pub fn to_toml(&self) -> Result<String> {
        if self.is_empty() {
            return Ok(String::new());
        }
        match json_to_toml(&self.0) {
            Some(toml::Value::Table(table)) => Ok(toml::to_string(&table)?),
            Some(_) | None => Err(LifecycleError::Serialization(format!(
                "layer config must be a table, got {}",
                self.0
            ))),
        }
    }
}

fn toml_to_json(value: toml::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

fn json_to_toml(value: &serde_json::Value) -> Option<toml::Value> {
    use serde_json::Value;

    match value {
        Value::Null => None,
        Value::Bool(b) => Some(toml::Value::Boolean(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(toml::Value::Integer(i)),
            None => n.as_f64().map(toml::Value::Float),
        },
        Value::String(s) => Some(toml::Value::String(s.clone())),
        Value::Array(items) => Some(toml::Value::Array(
            items.iter().filter_map(json_to_toml).collect(),
        )),
        Value::Object(map) => Some(toml::Value::Table(
            map.iter()
                .filter_map(|(k, v)| json_to_toml(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
    }
}

/// Metadata for a single layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    /// Declared layer config
    #[serde(default)]
    pub data: LayerData,
    /// Digest of the uncompressed layer archive ("sha256:<hex>")
    pub diffid: String,
}

/// Layer name -> layer metadata for one buildpack.
pub type BuildpackMetadata = BTreeMap<String, LayerMetadata>;

/// Buildpack ID -> layer metadata for every buildpack in a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildMetadata(BTreeMap<String, BuildpackMetadata>);

impl BuildMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strictly parse a JSON document. Malformed input is an error.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| LifecycleError::Malformed(format!("build metadata: {}", e)))
    }

    /// Compact JSON with sorted keys.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn buildpack(&self, id: &str) -> Option<&BuildpackMetadata> {
        self.0.get(id)
    }

    pub fn layer(&self, buildpack: &str, layer: &str) -> Option<&LayerMetadata> {
        self.0.get(buildpack).and_then(|layers| layers.get(layer))
    }

    /// Record a layer, replacing any previous entry with the same name.
    pub fn insert_layer(
        &mut self,
        buildpack: impl Into<String>,
        layer: impl Into<String>,
        metadata: LayerMetadata,
    ) -> Option<LayerMetadata> {
        self.0
            .entry(buildpack.into())
            .or_default()
            .insert(layer.into(), metadata)
    }

    /// Iterate buildpacks in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BuildpackMetadata)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|layers| layers.is_empty())
    }

    pub fn layer_count(&self) -> usize {
        self.0.values().map(|layers| layers.len()).sum()
    }
}
