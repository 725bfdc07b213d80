//! In-memory OCI image.
//!
//! An `Image` is an immutable value: the image config plus an ordered list
//! of layers whose blobs live either in an OCI image layout on disk or in
//! memory. `with_layer` and `with_labels` return new images and leave the
//! receiver untouched.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use oci_distribution::manifest::OciImageManifest;
use oci_spec::image::ImageIndex;
use packs_core::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};

use crate::layer::{sha256_bytes, LayerBlob, LAYER_MEDIA_TYPE};

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const OCI_LAYOUT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
/// Creation time recorded for exported layers.
const CREATED: &str = "1980-01-01T00:00:01Z";

/// Image configuration (the config blob).
///
/// Only the fields the lifecycle reads or writes are typed; everything else
/// is carried through unchanged in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Runtime configuration section of the image config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Layer DiffIDs, bottom to top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// Where a layer blob's bytes come from.
#[derive(Clone)]
enum BlobSource {
    File(PathBuf),
    Memory(Arc<Vec<u8>>),
}

impl std::fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobSource::File(path) => write!(f, "File({})", path.display()),
            BlobSource::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
        }
    }
}

/// One image layer: its descriptor, DiffID and blob.
#[derive(Debug, Clone)]
pub struct ImageLayer {
    /// Blob media type
    pub media_type: String,
    /// Blob digest ("sha256:<hex>")
    pub digest: String,
    /// Blob size in bytes
    pub size: u64,
    /// Digest of the uncompressed archive ("sha256:<hex>")
    pub diff_id: String,
    source: BlobSource,
}

impl ImageLayer {
    /// Layer backed by a freshly built, in-memory blob.
    pub fn from_blob(blob: LayerBlob, diff_id: impl Into<String>) -> Self {
        Self {
            media_type: LAYER_MEDIA_TYPE.to_string(),
            digest: blob.digest,
            size: blob.size,
            diff_id: diff_id.into(),
            source: BlobSource::Memory(Arc::new(blob.bytes)),
        }
    }

    /// Open the blob for reading.
    pub fn open(&self) -> Result<Box<dyn Read + '_>> {
        match &self.source {
            BlobSource::File(path) => {
                let file = std::fs::File::open(path).map_err(|e| {
                    LifecycleError::io(format!("Failed to open layer blob {}", path.display()), e)
                })?;
                Ok(Box::new(file))
            }
            BlobSource::Memory(bytes) => Ok(Box::new(bytes.as_slice())),
        }
    }

    /// Read the whole blob.
    pub fn read_blob(&self) -> Result<Vec<u8>> {
        match &self.source {
            BlobSource::File(path) => std::fs::read(path).map_err(|e| {
                LifecycleError::io(format!("Failed to read layer blob {}", path.display()), e)
            }),
            BlobSource::Memory(bytes) => Ok(bytes.as_ref().clone()),
        }
    }

    fn write_to(&self, target: &Path) -> Result<()> {
        let result = match &self.source {
            BlobSource::File(path) => std::fs::copy(path, target).map(|_| ()),
            BlobSource::Memory(bytes) => std::fs::write(target, bytes.as_slice()),
        };
        result.map_err(|e| {
            LifecycleError::io(format!("Failed to write layer blob {}", self.digest), e)
        })
    }
}

/// An OCI image.
#[derive(Debug, Clone)]
pub struct Image {
    config: ConfigFile,
    layers: Vec<ImageLayer>,
}

impl Image {
    /// Create an image from a config and its layers.
    ///
    /// The config's `rootfs.diff_ids` must list the layers' DiffIDs in order.
    pub fn new(config: ConfigFile, layers: Vec<ImageLayer>) -> Result<Self> {
        let matches = config.rootfs.diff_ids.len() == layers.len()
            && config
                .rootfs
                .diff_ids
                .iter()
                .zip(&layers)
                .all(|(diff_id, layer)| diff_id == &layer.diff_id);
        if !matches {
            return Err(LifecycleError::OciImage(format!(
                "Config lists {} diff_ids but image has {} layers",
                config.rootfs.diff_ids.len(),
                layers.len()
            )));
        }
        Ok(Self { config, layers })
    }

    /// An image with no layers and no labels, for the host's architecture.
    pub fn scratch() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            config: ConfigFile {
                architecture: architecture.to_string(),
                os: "linux".to_string(),
                config: Some(ContainerConfig::default()),
                ..Default::default()
            },
            layers: Vec::new(),
        }
    }

    /// Load an image from an OCI image layout directory.
    ///
    /// The directory must contain `oci-layout`, `index.json` and
    /// `blobs/sha256/` with the manifest, config and layer blobs. Layer blobs
    /// stay on disk and are read on demand.
    pub fn from_layout(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref();
        validate_oci_layout(root_dir)?;

        let index_path = root_dir.join("index.json");
        let index_content = std::fs::read_to_string(&index_path).map_err(|e| {
            LifecycleError::io(format!("Failed to read {}", index_path.display()), e)
        })?;
        let index: ImageIndex = serde_json::from_str(&index_content)
            .map_err(|e| LifecycleError::OciImage(format!("Failed to parse index.json: {}", e)))?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| LifecycleError::OciImage("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest_bytes = read_blob(root_dir, &manifest_digest, "manifest")?;
        let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| LifecycleError::OciImage(format!("Failed to parse manifest: {}", e)))?;

        let config_bytes = read_blob(root_dir, &manifest.config.digest, "config")?;
        let config: ConfigFile = serde_json::from_slice(&config_bytes)
            .map_err(|e| LifecycleError::OciImage(format!("Failed to parse config: {}", e)))?;

        if manifest.layers.len() != config.rootfs.diff_ids.len() {
            return Err(LifecycleError::OciImage(format!(
                "Manifest has {} layers but config lists {} diff_ids",
                manifest.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (descriptor, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
            let blob = blob_path(root_dir, &descriptor.digest)?;
            if !blob.is_file() {
                return Err(LifecycleError::OciImage(format!(
                    "Missing layer blob {} in {}",
                    descriptor.digest,
                    root_dir.display()
                )));
            }
            layers.push(ImageLayer {
                media_type: descriptor.media_type.clone(),
                digest: descriptor.digest.clone(),
                size: descriptor.size.max(0) as u64,
                diff_id: diff_id.clone(),
                source: BlobSource::File(blob),
            });
        }

        tracing::debug!(
            path = %root_dir.display(),
            digest = %manifest_digest,
            layers = layers.len(),
            "Loaded OCI image"
        );

        Ok(Self { config, layers })
    }

    /// Write the image as an OCI image layout and return the manifest digest.
    pub fn write_layout(&self, dir: &Path) -> Result<String> {
        let blobs_dir = dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            LifecycleError::io(format!("Failed to create {}", blobs_dir.display()), e)
        })?;

        for layer in &self.layers {
            let target = blob_path(dir, &layer.digest)?;
            if !target.exists() {
                layer.write_to(&target)?;
            }
        }

        let (config_bytes, manifest_bytes) = self.encode_manifest()?;
        let config_digest = sha256_bytes(&config_bytes);
        let manifest_digest = sha256_bytes(&manifest_bytes);
        write_file(&blobs_dir.join(&config_digest), &config_bytes)?;
        write_file(&blobs_dir.join(&manifest_digest), &manifest_bytes)?;

        write_file(&dir.join("oci-layout"), OCI_LAYOUT.as_bytes())?;
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": MANIFEST_MEDIA_TYPE,
                "digest": format!("sha256:{}", manifest_digest),
                "size": manifest_bytes.len()
            }]
        });
        write_file(&dir.join("index.json"), &serde_json::to_vec_pretty(&index)?)?;

        Ok(format!("sha256:{}", manifest_digest))
    }

    /// Digest of the manifest `write_layout` would write.
    pub fn manifest_digest(&self) -> Result<String> {
        let (_, manifest_bytes) = self.encode_manifest()?;
        Ok(format!("sha256:{}", sha256_bytes(&manifest_bytes)))
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Layers, bottom to top.
    pub fn layers(&self) -> &[ImageLayer] {
        &self.layers
    }

    pub fn diff_ids(&self) -> &[String] {
        &self.config.rootfs.diff_ids
    }

    /// Find the layer whose uncompressed archive has the given DiffID.
    pub fn layer_by_diff_id(&self, diff_id: &str) -> Option<&ImageLayer> {
        self.layers.iter().find(|layer| layer.diff_id == diff_id)
    }

    /// All labels, empty if the config has none.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.config
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default()
    }

    /// Get a label value by key.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(key))
            .map(|s| s.as_str())
    }

    /// Return a new image with `layer` appended on top.
    ///
    /// History entries carry a fixed timestamp so identical inputs give
    /// identical manifests.
    pub fn with_layer(&self, layer: ImageLayer, created_by: &str) -> Image {
        let mut next = self.clone();
        next.config.rootfs.diff_ids.push(layer.diff_id.clone());
        next.config.history.push(serde_json::json!({
            "created": CREATED,
            "created_by": created_by
        }));
        next.config.created = Some(CREATED.to_string());
        next.layers.push(layer);
        next
    }

    /// Return a new image with `labels` set, replacing existing values for
    /// the same keys.
    pub fn with_labels(&self, labels: BTreeMap<String, String>) -> Image {
        let mut next = self.clone();
        next.config
            .config
            .get_or_insert_with(ContainerConfig::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
        next
    }

    /// Serialize the config blob and the manifest referencing it.
    pub(crate) fn encode_manifest(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let config_bytes = serde_json::to_vec(&self.config)?;
        let layers: Vec<serde_json::Value> = self
            .layers
            .iter()
            .map(|layer| {
                serde_json::json!({
                    "mediaType": layer.media_type,
                    "digest": layer.digest,
                    "size": layer.size
                })
            })
            .collect();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": format!("sha256:{}", sha256_bytes(&config_bytes)),
                "size": config_bytes.len()
            },
            "layers": layers
        });
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        Ok((config_bytes, manifest_bytes))
    }
}

/// Validate that the directory contains an OCI layout.
fn validate_oci_layout(root_dir: &Path) -> Result<()> {
    for required in ["oci-layout", "index.json", "blobs"] {
        if !root_dir.join(required).exists() {
            return Err(LifecycleError::OciImage(format!(
                "Not a valid OCI layout: missing {} in {}",
                required,
                root_dir.display()
            )));
        }
    }
    Ok(())
}

/// The hex part of a `sha256:<64 lowercase hex>` digest.
///
/// Digests come from manifests and index files, so they are checked before
/// being used as file names.
pub(crate) fn digest_hex(digest: &str) -> Result<&str> {
    digest
        .strip_prefix("sha256:")
        .filter(|hex| {
            hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
        .ok_or_else(|| LifecycleError::OciImage(format!("Invalid blob digest: {:?}", digest)))
}

/// Get the path to a blob by digest.
pub(crate) fn blob_path(root_dir: &Path, digest: &str) -> Result<PathBuf> {
    let hex = digest_hex(digest)?;
    Ok(root_dir.join("blobs").join("sha256").join(hex))
}

fn read_blob(root_dir: &Path, digest: &str, what: &str) -> Result<Vec<u8>> {
    let path = blob_path(root_dir, digest)?;
    std::fs::read(&path).map_err(|e| {
        LifecycleError::OciImage(format!("Failed to read {} at {}: {}", what, path.display(), e))
    })
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)
        .map_err(|e| LifecycleError::io(format!("Failed to write {}", path.display()), e))
}
