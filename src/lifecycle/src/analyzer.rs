//! Analyze phase: restore cached layers from the previous build.
//!
//! The analyzer reads build metadata from the previous image's label (or a
//! document supplied by the caller) and seeds the launch directory with it:
//! a `<layer>.toml` sidecar for every recorded layer of every buildpack in
//! the group, and, when the previous image is available, the layer's
//! contents under `<launch>/<buildpack>/<layer>/`.

use std::path::{Path, PathBuf};

use packs_core::buildpack::{is_valid_component, BuildpackGroup};
use packs_core::config::{LifecycleConfig, BUILD_METADATA_LABEL};
use packs_core::error::{LifecycleError, Result};
use packs_core::metadata::BuildMetadata;

use crate::layer::restore_layer;
use crate::metadata::{self, write_sidecar};
use crate::oci::Image;
use crate::source::ImageSource;

/// Where the analyzer gets build metadata from.
#[derive(Debug)]
pub enum MetadataSource<'a> {
    /// The previous image: metadata from its label, contents from its layers
    Image(&'a Image),
    /// A metadata document; only sidecars are written
    Document(BuildMetadata),
    /// Nothing cached
    None,
}

impl<'a> MetadataSource<'a> {
    /// Combine the optional inputs of the analyze command. Supplying both an
    /// image and a document is a configuration error.
    pub fn from_parts(image: Option<&'a Image>, document: Option<BuildMetadata>) -> Result<Self> {
        match (image, document) {
            (Some(_), Some(_)) => Err(LifecycleError::Config(
                "metadata can come from the previous image or a document, not both".to_string(),
            )),
            (Some(image), None) => Ok(MetadataSource::Image(image)),
            (None, Some(document)) => Ok(MetadataSource::Document(document)),
            (None, None) => Ok(MetadataSource::None),
        }
    }
}

/// Why analysis was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The image source denied access to the previous image
    Unauthorized(String),
    /// There is no previous image
    NotFound(String),
}

impl SkipReason {
    /// The skip reason for errors that mean "no previous image".
    pub fn from_error(err: &LifecycleError) -> Option<Self> {
        match err {
            LifecycleError::Unauthorized { .. } => Some(SkipReason::Unauthorized(err.to_string())),
            LifecycleError::ImageNotFound(_) => Some(SkipReason::NotFound(err.to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unauthorized(detail) => write!(f, "not authorized: {}", detail),
            SkipReason::NotFound(detail) => write!(f, "no previous image: {}", detail),
        }
    }
}

/// Counts of what was written to the launch directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Buildpacks with at least one recorded layer
    pub buildpacks: usize,
    /// Layer directories restored from the previous image
    pub layers: usize,
    /// Sidecar files written
    pub sidecars: usize,
}

/// Result of an analysis that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzeOutcome {
    Restored(RestoreSummary),
    Skipped(SkipReason),
}

/// Restores cached layers for a buildpack group.
#[derive(Debug, Clone)]
pub struct Analyzer {
    group: BuildpackGroup,
    launch_dir: PathBuf,
    image_launch_dir: PathBuf,
    metadata_label: String,
}

impl Analyzer {
    pub fn new(group: BuildpackGroup, launch_dir: impl Into<PathBuf>) -> Self {
        Self {
            group,
            launch_dir: launch_dir.into(),
            image_launch_dir: PathBuf::from("/launch"),
            metadata_label: BUILD_METADATA_LABEL.to_string(),
        }
    }

    pub fn from_config(group: BuildpackGroup, config: &LifecycleConfig) -> Self {
        Self::new(group, config.launch_dir.clone())
            .with_image_launch_dir(config.image_launch_dir.clone())
            .with_metadata_label(config.metadata_label.clone())
    }

    /// Location of the launch directory inside images.
    pub fn with_image_launch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_launch_dir = dir.into();
        self
    }

    pub fn with_metadata_label(mut self, label: impl Into<String>) -> Self {
        self.metadata_label = label.into();
        self
    }

    /// Seed the launch directory from `source`.
    pub fn analyze(&self, source: MetadataSource<'_>) -> Result<AnalyzeOutcome> {
        let (metadata, image) = match source {
            MetadataSource::Image(image) => {
                (metadata::decode(image.label(&self.metadata_label)), Some(image))
            }
            MetadataSource::Document(document) => (document, None),
            MetadataSource::None => (BuildMetadata::new(), None),
        };

        for (buildpack, _) in metadata.iter() {
            if !self.group.contains(buildpack) {
                tracing::debug!(buildpack = %buildpack, "Ignoring metadata for buildpack not in group");
            }
        }

        let mut summary = RestoreSummary::default();
        for buildpack in self.group.iter() {
            let Some(layers) = metadata.buildpack(&buildpack.id) else {
                continue;
            };
            if layers.is_empty() {
                continue;
            }
            summary.buildpacks += 1;

            let bp_dir = self.launch_dir.join(&buildpack.id);
            for (name, layer) in layers {
                if !is_valid_component(name) {
                    tracing::warn!(buildpack = %buildpack.id, layer = %name, "Skipping layer with invalid name");
                    continue;
                }

                write_sidecar(&bp_dir.join(format!("{}.toml", name)), &layer.data)?;
                summary.sidecars += 1;

                let Some(image) = image else {
                    continue;
                };
                match image.layer_by_diff_id(&layer.diffid) {
                    Some(image_layer) => {
                        let prefix = self.image_launch_dir.join(&buildpack.id).join(name);
                        let target = bp_dir.join(name);
                        let entries = restore_layer(
                            image_layer.open()?,
                            &image_layer.media_type,
                            &prefix,
                            &target,
                        )?;
                        summary.layers += 1;
                        tracing::debug!(
                            buildpack = %buildpack.id,
                            layer = %name,
                            diff_id = %layer.diffid,
                            entries,
                            "Restored layer"
                        );
                    }
                    None => {
                        tracing::warn!(
                            buildpack = %buildpack.id,
                            layer = %name,
                            diff_id = %layer.diffid,
                            "Layer not found in previous image, restoring config only"
                        );
                    }
                }
            }
        }

        tracing::info!(
            launch_dir = %self.launch_dir.display(),
            buildpacks = summary.buildpacks,
            layers = summary.layers,
            sidecars = summary.sidecars,
            "Analysis complete"
        );
        Ok(AnalyzeOutcome::Restored(summary))
    }

    /// Fetch the previous image from `source` and analyze it.
    ///
    /// An unauthorized or missing image skips analysis instead of failing.
    pub async fn analyze_source(&self, source: &dyn ImageSource) -> Result<AnalyzeOutcome> {
        let image = match source.image().await {
            Ok(image) => image,
            Err(e) => match SkipReason::from_error(&e) {
                Some(reason) => {
                    tracing::warn!(image = %source.describe(), reason = %reason, "Skipping analysis");
                    return Ok(AnalyzeOutcome::Skipped(reason));
                }
                None => return Err(e),
            },
        };

        let analyzer = self.clone();
        tokio::task::spawn_blocking(move || analyzer.analyze(MetadataSource::Image(&image)))
            .await
            .map_err(|e| LifecycleError::Layer(format!("Analyze task failed: {}", e)))?
    }

    pub fn launch_dir(&self) -> &Path {
        &self.launch_dir
    }
}
