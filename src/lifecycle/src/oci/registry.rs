//! Registry client for fetching previous images and publishing new ones.
//!
//! Uses the `oci-distribution` crate for the HTTP and token plumbing. Only
//! the manifest fetch is retried: it is read-only, and it is the call that
//! decides whether a previous image exists at all. Pushes are never retried.

use std::path::{Path, PathBuf};
use std::time::Duration;

use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer as OciLayer};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::{ImageIndexEntry, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::Client;
use packs_core::error::{LifecycleError, Result};

use super::credentials::CredentialStore;
use super::image::{digest_hex, Image};
use super::reference::ImageReference;

/// Delay before the first manifest retry; later retries wait proportionally
/// longer.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, or anonymous if either is
    /// unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Credentials from `store` for `registry`, falling back to the
    /// environment, then anonymous.
    pub fn from_credential_store(store: &CredentialStore, registry: &str) -> Self {
        match store.get(registry) {
            Ok(Some((username, password))) => return Self::basic(username, password),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
            }
        }
        Self::from_env()
    }

    /// Credentials used for `registry`. Without helpers every request is
    /// anonymous.
    pub fn resolve(registry: &str, use_helpers: bool) -> Self {
        if !use_helpers {
            return Self::anonymous();
        }
        match CredentialStore::default_path() {
            Ok(store) => Self::from_credential_store(&store, registry),
            Err(_) => Self::from_env(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls images from a registry into an OCI image layout.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
    attempts: u32,
}

impl RegistryPuller {
    /// Puller that tries each manifest fetch once.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
            attempts: 1,
        }
    }

    /// Allow up to `attempts` manifest fetches for transient failures.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Fetch the image manifest and its digest.
    ///
    /// Unauthorized and not-found answers are returned immediately; other
    /// failures are retried with linear backoff.
    pub async fn fetch_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<(OciImageManifest, String)> {
        let oci_ref = reference.to_oci_reference();
        let auth = self.auth.to_oci_auth();

        let mut attempt = 1;
        loop {
            match self.client.pull_image_manifest(&oci_ref, &auth).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let err = classify_error(&reference.registry, "pull manifest", e);
                    if attempt >= self.attempts || !matches!(err, LifecycleError::Registry { .. }) {
                        return Err(err);
                    }
                    tracing::warn!(
                        reference = %reference,
                        attempt,
                        error = %err,
                        "Manifest fetch failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Pull the blobs of a manifest returned by `fetch_manifest` into an OCI
    /// image layout at `target_dir`.
    pub async fn pull(
        &self,
        reference: &ImageReference,
        manifest: &OciImageManifest,
        manifest_digest: &str,
        target_dir: &Path,
    ) -> Result<()> {
        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        let blobs_dir = write_manifest_files(target_dir, manifest, manifest_digest)?;

        let oci_ref = reference.to_oci_reference();
        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            digest_hex(&descriptor.digest)?;
            tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Pulling blob");
            let mut data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(&oci_ref, descriptor, &mut data)
                .await
                .map_err(|e| {
                    classify_error(
                        &reference.registry,
                        &format!("pull blob {}", descriptor.digest),
                        e,
                    )
                })?;
            write_blob(&blobs_dir, &descriptor.digest, &data)?;
        }

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            "Image pulled"
        );
        Ok(())
    }
}

/// Pushes images to a registry.
pub struct RegistryPusher {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPusher {
    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Push all blobs and the manifest of `image`. Returns the manifest URL.
    pub async fn push(&self, reference: &ImageReference, image: &Image) -> Result<String> {
        tracing::info!(
            reference = %reference,
            layers = image.layers().len(),
            "Pushing image to registry"
        );

        let (config_bytes, manifest_bytes) = image.encode_manifest()?;
        let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes)?;
        let config = Config::new(config_bytes, manifest.config.media_type.clone(), None);

        let mut layers = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            layers.push(OciLayer::new(
                layer.read_blob()?,
                layer.media_type.clone(),
                None,
            ));
        }

        let response = self
            .client
            .push(
                &reference.to_oci_reference(),
                &layers,
                config,
                &self.auth.to_oci_auth(),
                Some(manifest),
            )
            .await
            .map_err(|e| classify_error(&reference.registry, "push image", e))?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Image pushed"
        );

        Ok(response.manifest_url)
    }
}

/// Map a registry client error onto the lifecycle taxonomy.
///
/// Authorization failures become `Unauthorized` and missing images become
/// `ImageNotFound`, so callers can tell "no previous image" apart from a
/// broken registry.
pub fn classify_error(registry: &str, action: &str, err: OciDistributionError) -> LifecycleError {
    let unauthorized = || LifecycleError::Unauthorized {
        registry: registry.to_string(),
        message: format!("{}: {}", action, err),
    };
    let not_found = || LifecycleError::ImageNotFound(format!("{} ({}): {}", registry, action, err));

    match &err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => unauthorized(),
        OciDistributionError::ImageManifestNotFoundError(_) => not_found(),
        OciDistributionError::ServerError { code: 401 | 403, .. } => unauthorized(),
        OciDistributionError::ServerError { code: 404, .. } => not_found(),
        OciDistributionError::RegistryError { envelope, .. } => {
            if envelope
                .errors
                .iter()
                .any(|e| matches!(e.code, OciErrorCode::Unauthorized | OciErrorCode::Denied))
            {
                unauthorized()
            } else if envelope
                .errors
                .iter()
                .any(|e| matches!(e.code, OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown))
            {
                not_found()
            } else {
                LifecycleError::Registry {
                    registry: registry.to_string(),
                    message: format!("{}: {}", action, err),
                }
            }
        }
        _ => LifecycleError::Registry {
            registry: registry.to_string(),
            message: format!("{}: {}", action, err),
        },
    }
}

/// Write the manifest blob, `oci-layout` and `index.json` of a pulled image
/// and return the blobs directory.
fn write_manifest_files(
    target_dir: &Path,
    manifest: &OciImageManifest,
    manifest_digest: &str,
) -> Result<PathBuf> {
    let blobs_dir = target_dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir).map_err(|e| {
        LifecycleError::io(format!("Failed to create {}", blobs_dir.display()), e)
    })?;

    let manifest_json = serde_json::to_vec(manifest)?;
    write_blob(&blobs_dir, manifest_digest, &manifest_json)?;

    std::fs::write(
        target_dir.join("oci-layout"),
        r#"{"imageLayoutVersion":"1.0.0"}"#,
    )
    .map_err(|e| LifecycleError::io("Failed to write oci-layout", e))?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest_json.len()
        }]
    });
    std::fs::write(
        target_dir.join("index.json"),
        serde_json::to_string_pretty(&index)?,
    )
    .map_err(|e| LifecycleError::io("Failed to write index.json", e))?;

    Ok(blobs_dir)
}

fn write_blob(blobs_dir: &Path, digest: &str, data: &[u8]) -> Result<()> {
    let path = blobs_dir.join(digest_hex(digest)?);
    std::fs::write(&path, data)
        .map_err(|e| LifecycleError::io(format!("Failed to write blob {}", path.display()), e))
}

/// Select the linux manifest for the host architecture from a multi-arch
/// index. Built images always target linux.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(_, _)));
    }

    #[test]
    fn test_resolve_without_helpers_is_anonymous() {
        let auth = RegistryAuth::resolve("ghcr.io", false);
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_from_credential_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            r#"{"registries":{"ghcr.io":{"username":"user","password":"pass"}}}"#,
        )
        .unwrap();
        let store = CredentialStore::new(path);

        let auth = RegistryAuth::from_credential_store(&store, "ghcr.io");
        assert_eq!(auth.username.as_deref(), Some("user"));
        assert_eq!(auth.password.as_deref(), Some("pass"));
    }

    #[test]
    fn test_fetched_manifest_becomes_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config_bytes, manifest_bytes) = Image::scratch().encode_manifest().unwrap();
        let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes).unwrap();
        let digest = format!("sha256:{}", crate::layer::sha256_bytes(&manifest_bytes));

        let blobs_dir = write_manifest_files(dir.path(), &manifest, &digest).unwrap();
        write_blob(&blobs_dir, &manifest.config.digest, &config_bytes).unwrap();

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("index.json")).unwrap()).unwrap();
        assert_eq!(index["manifests"][0]["digest"], digest.as_str());
        let image = Image::from_layout(dir.path()).unwrap();
        assert!(image.layers().is_empty());
    }

    #[test]
    fn test_write_blob_rejects_malformed_digest() {
        let dir = tempfile::TempDir::new().unwrap();
        let blobs_dir = dir.path().join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).unwrap();

        for digest in ["sha256:../../../escape", "sha256:", "md5:abc"] {
            let err = write_blob(&blobs_dir, digest, b"data").unwrap_err();
            assert!(matches!(err, LifecycleError::OciImage(_)), "{}", digest);
        }
        assert!(!dir.path().join("escape").exists());
        assert_eq!(std::fs::read_dir(&blobs_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_manifest_files_reject_malformed_digest() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_, manifest_bytes) = Image::scratch().encode_manifest().unwrap();
        let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes).unwrap();

        let err = write_manifest_files(dir.path(), &manifest, "sha256:../index").unwrap_err();
        assert!(matches!(err, LifecycleError::OciImage(_)));
        assert!(!dir.path().join("index.json").exists());
    }

    #[test]
    fn test_classify_unauthorized() {
        let err = classify_error(
            "ghcr.io",
            "pull manifest",
            OciDistributionError::UnauthorizedError {
                url: "https://ghcr.io/v2/acme/app/manifests/latest".to_string(),
            },
        );
        assert!(matches!(err, LifecycleError::Unauthorized { .. }));
        assert!(err.is_skippable());
    }

    #[test]
    fn test_classify_manifest_not_found() {
        let err = classify_error(
            "ghcr.io",
            "pull manifest",
            OciDistributionError::ImageManifestNotFoundError("acme/app:latest".to_string()),
        );
        assert!(matches!(err, LifecycleError::ImageNotFound(_)));
    }

    #[test]
    fn test_classify_server_errors() {
        let forbidden = classify_error(
            "ghcr.io",
            "pull manifest",
            OciDistributionError::ServerError {
                code: 403,
                url: "https://ghcr.io".to_string(),
                message: "forbidden".to_string(),
            },
        );
        assert!(matches!(forbidden, LifecycleError::Unauthorized { .. }));

        let unavailable = classify_error(
            "ghcr.io",
            "pull manifest",
            OciDistributionError::ServerError {
                code: 503,
                url: "https://ghcr.io".to_string(),
                message: "unavailable".to_string(),
            },
        );
        assert!(matches!(unavailable, LifecycleError::Registry { .. }));
        assert!(!unavailable.is_skippable());
    }
}
