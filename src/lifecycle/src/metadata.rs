//! Build metadata codec.
//!
//! Build metadata is persisted as image labels:
//!
//! - the metadata label (`sh.packs.build` by default) holds the whole
//!   `BuildMetadata` as compact JSON,
//! - `<buildpack>.<layer>.diffid` holds each layer's DiffID,
//! - `<buildpack>.<layer>.toml` holds each layer's raw sidecar text.
//!
//! On the build host each layer's data lives in a `<launch>/<bp>/<layer>.toml`
//! sidecar next to the layer directory.

use std::collections::BTreeMap;
use std::path::Path;

use packs_core::error::{LifecycleError, Result};
use packs_core::metadata::{BuildMetadata, LayerData};

/// Per-layer label suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerLabel {
    DiffId,
    Toml,
}

impl LayerLabel {
    fn suffix(self) -> &'static str {
        match self {
            LayerLabel::DiffId => "diffid",
            LayerLabel::Toml => "toml",
        }
    }
}

/// Decode a metadata label value.
///
/// A missing, empty or unparsable label means there is no usable cache; it
/// yields empty metadata rather than an error.
pub fn decode(label: Option<&str>) -> BuildMetadata {
    let Some(content) = label.map(str::trim).filter(|c| !c.is_empty()) else {
        tracing::warn!("No build metadata label found, starting with an empty cache");
        return BuildMetadata::new();
    };

    match BuildMetadata::from_json(content) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring unreadable build metadata label");
            BuildMetadata::new()
        }
    }
}

/// Encode metadata as compact JSON with sorted keys.
pub fn encode(metadata: &BuildMetadata) -> Result<String> {
    metadata.to_json()
}

/// Label key for one layer, e.g. `io.packs.node.modules.diffid`.
pub fn layer_label_key(buildpack: &str, layer: &str, label: LayerLabel) -> String {
    format!("{}.{}.{}", buildpack, layer, label.suffix())
}

/// Accumulates labels for an export and rejects duplicate keys.
///
/// Buildpack IDs and layer names may both contain dots, so two distinct
/// layers can map to the same key.
#[derive(Debug, Default)]
pub struct LabelSet {
    labels: BTreeMap<String, String>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) -> Result<()> {
        if self.labels.contains_key(&key) {
            return Err(LifecycleError::LabelCollision { key });
        }
        self.labels.insert(key, value);
        Ok(())
    }

    /// Add the diffid and toml labels for one layer.
    pub fn insert_layer(
        &mut self,
        buildpack: &str,
        layer: &str,
        diff_id: &str,
        toml: &str,
    ) -> Result<()> {
        self.insert(
            layer_label_key(buildpack, layer, LayerLabel::DiffId),
            diff_id.to_string(),
        )?;
        self.insert(
            layer_label_key(buildpack, layer, LayerLabel::Toml),
            toml.to_string(),
        )
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.labels
    }
}

/// Contents of a `<layer>.toml` sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct Sidecar {
    /// Raw file text, copied verbatim into the `.toml` label
    pub raw: String,
    /// Parsed layer data
    pub data: LayerData,
}

/// Read a sidecar file. A missing file yields `None`.
pub fn read_sidecar(path: &Path) -> Result<Option<Sidecar>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(LifecycleError::io(
                format!("Failed to read layer config {}", path.display()),
                e,
            ))
        }
    };
    let data = LayerData::from_toml(&raw).map_err(|e| {
        LifecycleError::Malformed(format!("{}: {}", path.display(), e))
    })?;
    Ok(Some(Sidecar { raw, data }))
}

/// Write `data` as a sidecar file, creating parent directories.
pub fn write_sidecar(path: &Path, data: &LayerData) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            LifecycleError::io(format!("Failed to create {}", parent.display()), e)
        })?;
    }
    let text = data.to_toml()?;
    std::fs::write(path, text).map_err(|e| {
        LifecycleError::io(format!("Failed to write layer config {}", path.display()), e)
    })
}
