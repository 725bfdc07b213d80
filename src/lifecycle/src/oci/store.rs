//! Local on-disk image store.
//!
//! Images are kept as OCI image layouts under `<store>/sha256/<digest>/`,
//! with a persistent `index.json` mapping full references to digests. This
//! is the "daemon" the lifecycle reads previous images from and saves new
//! images to when no registry is involved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use packs_core::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use walkdir::WalkDir;

use super::image::digest_hex;

/// A stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Full image reference (e.g. "docker.io/library/app:latest")
    pub reference: String,
    /// Manifest digest (e.g. "sha256:abc123...")
    pub digest: String,
    /// When the reference was last written
    pub stored_at: DateTime<Utc>,
    /// Path to the OCI image layout
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-backed image store.
pub struct ImageStore {
    store_dir: PathBuf,
    index: RwLock<HashMap<String, StoredImage>>,
}

impl ImageStore {
    /// Open the store, creating its directory if needed.
    pub fn open(store_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|e| {
            LifecycleError::io(
                format!("Failed to create image store {}", store_dir.display()),
                e,
            )
        })?;

        let index = load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: RwLock::new(index),
        })
    }

    /// Get a stored image by reference.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        self.index.read().await.get(reference).cloned()
    }

    /// Get a stored image by manifest digest.
    pub async fn get_by_digest(&self, digest: &str) -> Option<StoredImage> {
        self.index
            .read()
            .await
            .values()
            .find(|image| image.digest == digest)
            .cloned()
    }

    /// Store the OCI layout in `source_dir` under `reference`.
    ///
    /// Content is keyed by digest, so storing the same image under a second
    /// reference does not copy it again.
    pub async fn put(&self, reference: &str, digest: &str, source_dir: &Path) -> Result<StoredImage> {
        let target_dir = self.store_dir.join("sha256").join(digest_hex(digest)?);

        if !target_dir.exists() {
            copy_layout(source_dir, &target_dir)?;
        }

        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            stored_at: Utc::now(),
            path: target_dir,
        };

        self.index
            .write()
            .await
            .insert(reference.to_string(), stored.clone());
        self.save_index().await?;

        tracing::debug!(reference, digest, "Stored image");
        Ok(stored)
    }

    /// Scratch directory inside the store, removed on drop.
    pub fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let tmp_root = self.store_dir.join("tmp");
        std::fs::create_dir_all(&tmp_root).map_err(|e| {
            LifecycleError::io(format!("Failed to create {}", tmp_root.display()), e)
        })?;
        tempfile::Builder::new()
            .prefix("layout-")
            .tempdir_in(&tmp_root)
            .map_err(|e| LifecycleError::io("Failed to create scratch directory", e))
    }

    async fn save_index(&self) -> Result<()> {
        let mut images: Vec<StoredImage> = self.index.read().await.values().cloned().collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        let data = serde_json::to_string_pretty(&StoreIndex { images })?;

        let index_path = self.store_dir.join("index.json");
        tokio::fs::write(&index_path, data).await.map_err(|e| {
            LifecycleError::io(format!("Failed to write {}", index_path.display()), e)
        })
    }
}

fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
    let index_path = store_dir.join("index.json");
    let data = match std::fs::read_to_string(&index_path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(LifecycleError::io(
                format!("Failed to read {}", index_path.display()),
                e,
            ))
        }
    };

    let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
        LifecycleError::OciImage(format!("Failed to parse image store index: {}", e))
    })?;

    // Entries whose content was deleted out from under the store are dropped.
    Ok(store_index
        .images
        .into_iter()
        .filter(|image| image.path.exists())
        .map(|image| (image.reference.clone(), image))
        .collect())
}

/// Copy an OCI layout directory tree.
fn copy_layout(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            LifecycleError::OciImage(format!("Failed to walk {}: {}", src.display(), e))
        })?;
        let relative = entry.path().strip_prefix(src).map_err(|e| {
            LifecycleError::OciImage(format!("Failed to copy {}: {}", entry.path().display(), e))
        })?;
        let target = dst.join(relative);
        let result = if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
        } else {
            std::fs::copy(entry.path(), &target).map(|_| ())
        };
        result.map_err(|e| LifecycleError::io(format!("Failed to copy to {}", target.display()), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::Image;
    use tempfile::TempDir;

    fn write_image(dir: &Path) -> String {
        Image::scratch().write_layout(dir).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("images");
        let store = ImageStore::open(&store_dir).unwrap();
        assert!(store_dir.exists());
        assert!(store.get("docker.io/library/app:latest").await.is_none());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        let digest = write_image(&source);
        let store = ImageStore::open(&tmp.path().join("store")).unwrap();

        let stored = store.put("docker.io/library/app:latest", &digest, &source).await.unwrap();
        assert!(stored.path.join("index.json").exists());

        let fetched = store.get("docker.io/library/app:latest").await.unwrap();
        assert_eq!(fetched.digest, digest);
        assert!(Image::from_layout(&fetched.path).is_ok());

        let by_digest = store.get_by_digest(&digest).await.unwrap();
        assert_eq!(by_digest.reference, "docker.io/library/app:latest");
        assert!(store.get("docker.io/library/other:latest").await.is_none());
    }

    #[tokio::test]
    async fn test_index_persists() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        let digest = write_image(&source);
        let store_dir = tmp.path().join("store");

        {
            let store = ImageStore::open(&store_dir).unwrap();
            store.put("app", &digest, &source).await.unwrap();
        }

        let reopened = ImageStore::open(&store_dir).unwrap();
        assert_eq!(reopened.get("app").await.unwrap().digest, digest);
    }

    #[tokio::test]
    async fn test_second_reference_shares_content() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        let digest = write_image(&source);
        let store = ImageStore::open(&tmp.path().join("store")).unwrap();

        let first = store.put("a", &digest, &source).await.unwrap();
        let second = store.put("b", &digest, &first.path).await.unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(store.get("b").await.unwrap().digest, digest);
    }

    #[tokio::test]
    async fn test_put_rejects_malformed_digest() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        write_image(&source);
        let store_dir = tmp.path().join("store");
        let store = ImageStore::open(&store_dir).unwrap();

        let err = store.put("app", "sha256:../../escape", &source).await.unwrap_err();
        assert!(matches!(err, LifecycleError::OciImage(_)));
        assert!(!tmp.path().join("escape").exists());
        assert!(store.get("app").await.is_none());
    }

    #[test]
    fn test_scratch_dir_is_inside_store() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::open(tmp.path()).unwrap();
        let scratch = store.scratch_dir().unwrap();
        assert!(scratch.path().starts_with(tmp.path()));
    }
}
