//! Registry credentials on disk.
//!
//! Credentials live at `~/.packs/auth/credentials.json`, keyed by registry
//! host. The lifecycle only reads them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use packs_core::error::{LifecycleError, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct Credential {
    username: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    registries: BTreeMap<String, Credential>,
}

/// Per-registry username/password store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.packs/auth/credentials.json`.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            LifecycleError::Config("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self::new(home.join(".packs").join("auth").join("credentials.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Credentials for `registry` as `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        Ok(file
            .registries
            .get(&normalize_registry(registry))
            .map(|c| (c.username.clone(), c.password.clone())))
    }

    fn load(&self) -> Result<CredentialFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFile::default())
            }
            Err(e) => {
                return Err(LifecycleError::io(
                    format!("Failed to read credential store {}", self.path.display()),
                    e,
                ))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            LifecycleError::Config(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Docker Hub has several host names for the same registry.
fn normalize_registry(registry: &str) -> String {
    let registry = registry.trim().to_lowercase();
    match registry.as_str() {
        "docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        _ => registry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_store(dir: &TempDir, content: &str) -> CredentialStore {
        let path = dir.path().join("auth").join("credentials.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        CredentialStore::new(path)
    }

    #[test]
    fn test_get() {
        let dir = TempDir::new().unwrap();
        let store = write_store(
            &dir,
            r#"{"registries":{"ghcr.io":{"username":"user","password":"secret"}}}"#,
        );

        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user".to_string(), "secret".to_string()))
        );
        assert_eq!(store.get("quay.io").unwrap(), None);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_docker_hub_aliases_share_entry() {
        let dir = TempDir::new().unwrap();
        let store = write_store(
            &dir,
            r#"{"registries":{"index.docker.io":{"username":"user","password":"pass"}}}"#,
        );

        assert!(store.get("docker.io").unwrap().is_some());
        assert!(store.get("registry-1.docker.io").unwrap().is_some());
        assert!(store.get("INDEX.DOCKER.IO").unwrap().is_some());
    }

    #[test]
    fn test_file_without_registries() {
        let dir = TempDir::new().unwrap();
        let store = write_store(&dir, "{}");
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let store = write_store(&dir, "{");

        let err = store.get("ghcr.io").unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));
    }
}
