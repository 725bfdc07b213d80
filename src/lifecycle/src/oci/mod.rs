//! OCI image support for the lifecycle.
//!
//! - `Image`: immutable in-memory image, loaded from and written to OCI
//!   image layouts
//! - `ImageReference`: repository name parsing
//! - `ImageStore`: local on-disk store of image layouts
//! - `RegistryPuller` / `RegistryPusher`: registry access
//!
//! ```text
//! image/
//! ├── oci-layout           (OCI layout marker)
//! ├── index.json           (image index)
//! └── blobs/sha256/
//!     ├── <manifest>
//!     ├── <config>         (labels, rootfs.diff_ids)
//!     └── <layers>         (gzip tar blobs)
//! ```

pub mod credentials;
mod image;
pub mod reference;
pub mod registry;
pub mod store;

pub use credentials::CredentialStore;
pub use image::{ConfigFile, ContainerConfig, Image, ImageLayer, RootFs};
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryPuller, RegistryPusher};
pub use store::{ImageStore, StoredImage};
