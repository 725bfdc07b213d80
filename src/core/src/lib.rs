//! Packs Core - Shared Types
//!
//! Errors, configuration, buildpack groups and the layer metadata model
//! used by the analyze and export phases.

pub mod buildpack;
pub mod config;
pub mod error;
pub mod metadata;

// Re-export commonly used types
pub use buildpack::{Buildpack, BuildpackGroup};
pub use config::{LifecycleConfig, LogLevel, BUILD_METADATA_LABEL};
pub use error::{exit_code, LifecycleError, Result};
pub use metadata::{BuildMetadata, BuildpackMetadata, LayerData, LayerMetadata};

/// Packs lifecycle version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
