//! Packs Lifecycle - Analyze and Export.
//!
//! Analyze restores the layers a previous build left in its image into the
//! launch directory; Export turns the launch directory back into image
//! layers on top of a stack image and records what it wrote in labels.

#![allow(clippy::result_large_err)]

pub mod analyzer;
pub mod exporter;
pub mod layer;
pub mod metadata;
pub mod oci;
pub mod source;

// Re-export common types
pub use analyzer::{AnalyzeOutcome, Analyzer, MetadataSource, RestoreSummary, SkipReason};
pub use exporter::Exporter;
pub use layer::{build_layer, restore_layer, LayerArchive, LayerBlob, LAYER_MEDIA_TYPE};
pub use metadata::{LabelSet, LayerLabel, Sidecar};
pub use oci::{Image, ImageLayer, ImageReference, ImageStore, RegistryAuth};
pub use source::{source_for, DaemonSource, ImageSource, RegistrySource};

/// Packs lifecycle version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
