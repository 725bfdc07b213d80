//! Image sources.
//!
//! An `ImageSource` yields the image stored under one repository name and
//! persists new images under that name. The analyzer reads the previous
//! build's image through it and the export command saves the result
//! through it. Two implementations exist: a registry, and the local image
//! store (the "daemon").

use std::sync::Arc;

use async_trait::async_trait;
use packs_core::config::LifecycleConfig;
use packs_core::error::{LifecycleError, Result};

use crate::oci::{Image, ImageReference, ImageStore, RegistryAuth, RegistryPuller, RegistryPusher};

/// Where images for one repository name come from and go to.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Human-readable name of the image, for logs.
    fn describe(&self) -> String;

    /// Fetch the image.
    ///
    /// Fails with `Unauthorized` when access is denied and `ImageNotFound`
    /// when there is no such image; other errors mean the source itself is
    /// broken.
    async fn image(&self) -> Result<Image>;

    /// Persist `image` under this source's name and return an identifier
    /// for it (manifest digest or manifest URL).
    async fn save(&self, image: &Image) -> Result<String>;
}

/// Images in a remote registry.
///
/// Pulled images are cached in the local store, keyed by manifest digest.
pub struct RegistrySource {
    reference: ImageReference,
    store: Arc<ImageStore>,
    puller: RegistryPuller,
    pusher: RegistryPusher,
}

impl RegistrySource {
    pub fn new(
        reference: ImageReference,
        store: Arc<ImageStore>,
        auth: RegistryAuth,
        attempts: u32,
    ) -> Self {
        Self {
            reference,
            store,
            puller: RegistryPuller::with_auth(auth.clone()).with_attempts(attempts),
            pusher: RegistryPusher::with_auth(auth),
        }
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn describe(&self) -> String {
        self.reference.full_reference()
    }

    async fn image(&self) -> Result<Image> {
        let full_ref = self.reference.full_reference();
        let (manifest, digest) = self.puller.fetch_manifest(&self.reference).await?;

        if let Some(stored) = self.store.get_by_digest(&digest).await {
            tracing::info!(reference = %full_ref, digest = %digest, "Using cached image content");
            let stored = self.store.put(&full_ref, &digest, &stored.path).await?;
            return Image::from_layout(&stored.path);
        }

        let scratch = self.store.scratch_dir()?;
        self.puller
            .pull(&self.reference, &manifest, &digest, scratch.path())
            .await?;
        let stored = self.store.put(&full_ref, &digest, scratch.path()).await?;
        Image::from_layout(&stored.path)
    }

    async fn save(&self, image: &Image) -> Result<String> {
        self.pusher.push(&self.reference, image).await
    }
}

/// Images in the local image store.
pub struct DaemonSource {
    reference: ImageReference,
    store: Arc<ImageStore>,
}

impl DaemonSource {
    pub fn new(reference: ImageReference, store: Arc<ImageStore>) -> Self {
        Self { reference, store }
    }
}

#[async_trait]
impl ImageSource for DaemonSource {
    fn describe(&self) -> String {
        self.reference.full_reference()
    }

    async fn image(&self) -> Result<Image> {
        let full_ref = self.reference.full_reference();
        let stored = self
            .store
            .get(&full_ref)
            .await
            .ok_or_else(|| LifecycleError::ImageNotFound(full_ref.clone()))?;
        tracing::debug!(reference = %full_ref, digest = %stored.digest, "Found image in local store");
        Image::from_layout(&stored.path)
    }

    async fn save(&self, image: &Image) -> Result<String> {
        let full_ref = self.reference.full_reference();
        let scratch = self.store.scratch_dir()?;
        let digest = image.write_layout(scratch.path())?;
        self.store.put(&full_ref, &digest, scratch.path()).await?;
        tracing::info!(reference = %full_ref, digest = %digest, "Saved image to local store");
        Ok(digest)
    }
}

/// Build the source for `reference`: the local store when `use_daemon` is
/// set, the registry otherwise. `use_helpers` enables stored and
/// environment credentials for registry access.
pub fn source_for(
    reference: &str,
    use_daemon: bool,
    use_helpers: bool,
    config: &LifecycleConfig,
) -> Result<Box<dyn ImageSource>> {
    let reference = ImageReference::parse(reference)?;
    let store = Arc::new(ImageStore::open(&config.store_dir)?);

    if use_daemon {
        return Ok(Box::new(DaemonSource::new(reference, store)));
    }

    let auth = RegistryAuth::resolve(&reference.registry, use_helpers);
    Ok(Box::new(RegistrySource::new(
        reference,
        store,
        auth,
        config.pull_retries,
    )))
}
