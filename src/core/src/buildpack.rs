//! Buildpack descriptors and the ordered buildpack group.
//!
//! The group is read from a `group.toml` file produced by detection:
//!
//! ```toml
//! [[buildpacks]]
//! id = "io.packs.nodejs"
//! version = "1.2.0"
//!
//! [[buildpacks]]
//! id = "io.packs.npm"
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

/// A single buildpack in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buildpack {
    /// Buildpack ID, also the name of its namespace in the launch directory
    pub id: String,
    /// Buildpack version
    #[serde(default)]
    pub version: String,
}

impl Buildpack {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

/// Ordered buildpack group.
///
/// Buildpacks restore and export in this order. A buildpack ID may appear
/// only once, so every `<buildpack-id>/<layer-name>` pair has one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackGroup {
    #[serde(default)]
    pub buildpacks: Vec<Buildpack>,
}

impl BuildpackGroup {
    /// Create a validated group from a list of buildpacks.
    pub fn new(buildpacks: Vec<Buildpack>) -> Result<Self> {
        let group = Self { buildpacks };
        group.validate()?;
        Ok(group)
    }

    /// Parse and validate a group from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let group: Self = toml::from_str(content)
            .map_err(|e| LifecycleError::Malformed(format!("buildpack group: {}", e)))?;
        group.validate()?;
        Ok(group)
    }

    /// Read and validate a group file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LifecycleError::io(format!("read group {}", path.display()), e))?;
        Self::from_toml(&content)
    }

    /// Reject empty and duplicate buildpack IDs, and IDs that cannot be used
    /// as a single path component.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for bp in &self.buildpacks {
            if !is_valid_component(&bp.id) {
                return Err(LifecycleError::Malformed(format!(
                    "invalid buildpack id '{}'",
                    bp.id
                )));
            }
            if !seen.insert(bp.id.as_str()) {
                return Err(LifecycleError::Malformed(format!(
                    "buildpack '{}' appears more than once in the group",
                    bp.id
                )));
            }
        }
        Ok(())
    }

    /// Look up a buildpack by ID.
    pub fn get(&self, id: &str) -> Option<&Buildpack> {
        self.buildpacks.iter().find(|bp| bp.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buildpack> {
        self.buildpacks.iter()
    }

    pub fn len(&self) -> usize {
        self.buildpacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buildpacks.is_empty()
    }
}

/// Whether `name` is usable as a single directory name under the launch dir.
pub fn is_valid_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
