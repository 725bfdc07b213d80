//! Export phase: turn the launch directory into image layers.
//!
//! Every `<launch>/<buildpack>/<layer>/` directory becomes one layer on top
//! of the stack image. A `<layer>.toml` with no directory next to it asks
//! for the layer of the same name from the previous image to be carried
//! over unchanged. The resulting image records what it contains in the
//! build metadata label and in per-layer labels, which the next analyze
//! reads back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use packs_core::buildpack::BuildpackGroup;
use packs_core::config::{LifecycleConfig, BUILD_METADATA_LABEL};
use packs_core::error::{LifecycleError, Result};
use packs_core::metadata::{BuildMetadata, LayerData, LayerMetadata};
use tokio::sync::Semaphore;

use crate::layer::build_layer;
use crate::metadata::{self, read_sidecar, LabelSet};
use crate::oci::{Image, ImageLayer};

/// How one layer of the output image is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LayerPlan {
    /// Archive the layer directory
    Build,
    /// Carry the layer over from the previous image
    Reuse,
}

#[derive(Debug)]
struct LayerJob {
    buildpack: String,
    name: String,
    plan: LayerPlan,
}

/// A layer ready to be appended.
struct ExportedLayer {
    buildpack: String,
    name: String,
    layer: ImageLayer,
    data: LayerData,
    raw_toml: String,
}

/// Builds the output image for a buildpack group.
#[derive(Debug, Clone)]
pub struct Exporter {
    group: BuildpackGroup,
    launch_dir: PathBuf,
    image_launch_dir: PathBuf,
    metadata_label: String,
    workers: usize,
}

impl Exporter {
    pub fn new(group: BuildpackGroup, launch_dir: impl Into<PathBuf>) -> Self {
        Self {
            group,
            launch_dir: launch_dir.into(),
            image_launch_dir: PathBuf::from("/launch"),
            metadata_label: BUILD_METADATA_LABEL.to_string(),
            workers: 1,
        }
    }

    pub fn from_config(group: BuildpackGroup, config: &LifecycleConfig) -> Self {
        Self::new(group, config.launch_dir.clone())
            .with_image_launch_dir(config.image_launch_dir.clone())
            .with_metadata_label(config.metadata_label.clone())
            .with_workers(config.workers)
    }

    pub fn with_image_launch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_launch_dir = dir.into();
        self
    }

    pub fn with_metadata_label(mut self, label: impl Into<String>) -> Self {
        self.metadata_label = label.into();
        self
    }

    /// Maximum number of layers archived at the same time (at least 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Build a new image from `base` and the launch directory.
    ///
    /// `previous` supplies layers for `<layer>.toml` files that have no
    /// directory. Any failure aborts the export; `base` is never modified.
    pub async fn export(&self, base: &Image, previous: Option<&Image>) -> Result<Image> {
        let jobs = self.plan()?;
        tracing::info!(
            launch_dir = %self.launch_dir.display(),
            layers = jobs.len(),
            workers = self.workers,
            "Exporting launch directory"
        );

        let previous_metadata = previous
            .map(|image| metadata::decode(image.label(&self.metadata_label)))
            .unwrap_or_default();

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut pending: Vec<BoxFuture<'static, Result<Option<ExportedLayer>>>> =
            Vec::with_capacity(jobs.len());
        for job in jobs {
            match job.plan {
                LayerPlan::Build => pending.push(self.build_job(job, Arc::clone(&semaphore))),
                LayerPlan::Reuse => {
                    let reused = self.reuse_layer(job, previous, &previous_metadata);
                    pending.push(future::ready(reused.map(Some)).boxed());
                }
            }
        }

        // Results come back in job order regardless of completion order.
        let exported = future::try_join_all(pending).await?;

        let mut image = base.clone();
        let mut build_metadata = BuildMetadata::new();
        let mut labels = LabelSet::new();
        for layer in exported.into_iter().flatten() {
            labels.insert_layer(
                &layer.buildpack,
                &layer.name,
                &layer.layer.diff_id,
                &layer.raw_toml,
            )?;
            build_metadata.insert_layer(
                layer.buildpack.clone(),
                layer.name.clone(),
                LayerMetadata {
                    data: layer.data,
                    diffid: layer.layer.diff_id.clone(),
                },
            );
            let created_by = format!("packs-lifecycle: {}/{}", layer.buildpack, layer.name);
            image = image.with_layer(layer.layer, &created_by);
        }
        labels.insert(self.metadata_label.clone(), metadata::encode(&build_metadata)?)?;

        tracing::info!(
            layers = build_metadata.layer_count(),
            total_layers = image.layers().len(),
            "Export complete"
        );
        Ok(image.with_labels(labels.into_inner()))
    }

    /// List the layers to export, in group order then by layer name.
    fn plan(&self) -> Result<Vec<LayerJob>> {
        let entries = read_dir_sorted(&self.launch_dir)?;
        for (name, path) in &entries {
            if path.is_dir() && !self.group.contains(name) {
                tracing::warn!(directory = %name, "Ignoring directory of buildpack not in group");
            }
        }

        let mut jobs = Vec::new();
        for buildpack in self.group.iter() {
            let bp_dir = self.launch_dir.join(&buildpack.id);
            if !bp_dir.is_dir() {
                continue;
            }

            let mut layers: BTreeMap<String, LayerPlan> = BTreeMap::new();
            for (name, path) in read_dir_sorted(&bp_dir)? {
                if path.is_dir() {
                    layers.insert(name, LayerPlan::Build);
                } else if let Some(stem) = name.strip_suffix(".toml") {
                    if !stem.is_empty() {
                        layers.entry(stem.to_string()).or_insert(LayerPlan::Reuse);
                    }
                }
            }

            jobs.extend(layers.into_iter().map(|(name, plan)| LayerJob {
                buildpack: buildpack.id.clone(),
                name,
                plan,
            }));
        }
        Ok(jobs)
    }

    fn build_job(
        &self,
        job: LayerJob,
        semaphore: Arc<Semaphore>,
    ) -> BoxFuture<'static, Result<Option<ExportedLayer>>> {
        let bp_dir = self.launch_dir.join(&job.buildpack);
        let prefix = self.image_launch_dir.join(&job.buildpack).join(&job.name);

        async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| LifecycleError::Assembly(format!("Worker pool closed: {}", e)))?;
            tokio::task::spawn_blocking(move || build_exported_layer(job, &bp_dir, &prefix))
                .await
                .map_err(|e| LifecycleError::Layer(format!("Layer task failed: {}", e)))?
        }
        .boxed()
    }

    fn reuse_layer(
        &self,
        job: LayerJob,
        previous: Option<&Image>,
        previous_metadata: &BuildMetadata,
    ) -> Result<ExportedLayer> {
        let recorded = previous_metadata
            .layer(&job.buildpack, &job.name)
            .ok_or_else(|| {
                LifecycleError::Assembly(format!(
                    "{}/{} has no layer directory and no layer in the previous image",
                    job.buildpack, job.name
                ))
            })?;
        let layer = previous
            .and_then(|image| image.layer_by_diff_id(&recorded.diffid))
            .ok_or_else(|| LifecycleError::LayerNotFound {
                buildpack: job.buildpack.clone(),
                layer: job.name.clone(),
                diff_id: recorded.diffid.clone(),
            })?;

        let sidecar_path = self
            .launch_dir
            .join(&job.buildpack)
            .join(format!("{}.toml", job.name));
        let sidecar = read_sidecar(&sidecar_path)?;
        let (data, raw_toml) = sidecar.map(|s| (s.data, s.raw)).unwrap_or_default();

        tracing::debug!(
            buildpack = %job.buildpack,
            layer = %job.name,
            diff_id = %layer.diff_id,
            "Reusing layer from previous image"
        );
        Ok(ExportedLayer {
            buildpack: job.buildpack,
            name: job.name,
            layer: layer.clone(),
            data,
            raw_toml,
        })
    }
}

/// Archive one layer directory. A directory removed since planning is
/// skipped.
fn build_exported_layer(job: LayerJob, bp_dir: &Path, prefix: &Path) -> Result<Option<ExportedLayer>> {
    let Some(archive) = build_layer(&bp_dir.join(&job.name), prefix)? else {
        tracing::debug!(buildpack = %job.buildpack, layer = %job.name, "Layer directory vanished, skipping");
        return Ok(None);
    };
    let blob = archive.compress()?;
    let sidecar = read_sidecar(&bp_dir.join(format!("{}.toml", job.name)))?;
    let (data, raw_toml) = sidecar.map(|s| (s.data, s.raw)).unwrap_or_default();

    tracing::debug!(
        buildpack = %job.buildpack,
        layer = %job.name,
        diff_id = %archive.diff_id,
        size = blob.size,
        "Built layer"
    );
    Ok(Some(ExportedLayer {
        buildpack: job.buildpack,
        name: job.name,
        layer: ImageLayer::from_blob(blob, archive.diff_id),
        data,
        raw_toml,
    }))
}

/// Entries of `dir` with UTF-8 names, sorted by name.
fn read_dir_sorted(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let read = std::fs::read_dir(dir)
        .map_err(|e| LifecycleError::io(format!("Failed to read {}", dir.display()), e))?;

    let mut entries = Vec::new();
    for entry in read {
        let entry =
            entry.map_err(|e| LifecycleError::io(format!("Failed to read {}", dir.display()), e))?;
        match entry.file_name().into_string() {
            Ok(name) => entries.push((name, entry.path())),
            Err(name) => {
                tracing::warn!(entry = ?name, dir = %dir.display(), "Ignoring entry with non UTF-8 name")
            }
        }
    }
    entries.sort();
    Ok(entries)
}
