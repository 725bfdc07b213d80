use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LifecycleError, Result};

/// Label holding the encoded build metadata.
pub const BUILD_METADATA_LABEL: &str = "sh.packs.build";

/// Lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Launch directory on the build host
    pub launch_dir: PathBuf,

    /// Path to the buildpack group file (group.toml)
    pub group_path: PathBuf,

    /// Location of the launch directory inside the exported image
    pub image_launch_dir: PathBuf,

    /// Label key for the encoded build metadata
    pub metadata_label: String,

    /// Maximum number of layers built concurrently during export
    pub workers: usize,

    /// Attempts for read-only registry manifest fetches
    pub pull_retries: u32,

    /// Local image store directory
    pub store_dir: PathBuf,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            launch_dir: PathBuf::from("/launch"),
            group_path: PathBuf::from("./group.toml"),
            image_launch_dir: PathBuf::from("/launch"),
            metadata_label: BUILD_METADATA_LABEL.to_string(),
            workers: default_workers(),
            pull_retries: 3,
            store_dir: default_store_dir(),
            log_level: LogLevel::Info,
        }
    }
}

impl LifecycleConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LifecycleError::io(format!("read config {}", path.display()), e))?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            LifecycleError::Config(format!("parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that have no sensible fallback.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(LifecycleError::Config("workers must be at least 1".to_string()));
        }
        if self.pull_retries == 0 {
            return Err(LifecycleError::Config(
                "pull_retries must be at least 1".to_string(),
            ));
        }
        if self.metadata_label.trim().is_empty() {
            return Err(LifecycleError::Config(
                "metadata_label must not be empty".to_string(),
            ));
        }
        if !self.image_launch_dir.is_absolute() {
            return Err(LifecycleError::Config(format!(
                "image_launch_dir must be absolute: {}",
                self.image_launch_dir.display()
            )));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Default local image store (~/.packs/images).
fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".packs"))
        .unwrap_or_else(|| PathBuf::from(".packs"))
        .join("images")
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}
