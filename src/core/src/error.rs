use thiserror::Error;

/// Process exit codes reported at the CLI boundary.
pub mod exit_code {
    /// Generic failure.
    pub const FAILED: i32 = 1;
    /// Invalid command-line arguments.
    pub const INVALID_ARGS: i32 = 3;
    /// Invalid configuration or malformed input document.
    pub const INVALID_ENV: i32 = 4;
    /// A required image does not exist.
    pub const NOT_FOUND: i32 = 5;
    /// Restoring or exporting layers failed.
    pub const FAILED_BUILD: i32 = 7;
    /// The registry or local image store failed.
    pub const FAILED_TRANSPORT: i32 = 8;
}

/// Lifecycle error types
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The image source denied access to the image
    #[error("Unauthorized: {registry} - {message}")]
    Unauthorized { registry: String, message: String },

    /// The requested image does not exist in the image source
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// An input document (group, metadata) could not be parsed
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid command-line arguments
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// I/O error with the operation that caused it
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Building or restoring a layer archive failed
    #[error("Layer error: {0}")]
    Layer(String),

    /// A layer recorded in metadata is missing from the image
    #[error("Layer not found: {buildpack}/{layer} ({diff_id})")]
    LayerNotFound {
        buildpack: String,
        layer: String,
        diff_id: String,
    },

    /// Assembling the output image failed
    #[error("Image assembly failed: {0}")]
    Assembly(String),

    /// Two layers map to the same per-layer label key
    #[error("Label collision: {key}")]
    LabelCollision { key: String },

    /// Layer blob uses a media type that cannot be unpacked
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// OCI image layout error
    #[error("OCI image error: {0}")]
    OciImage(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LifecycleError {
    /// Wrap an I/O error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LifecycleError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error means "no prior image", which analyze treats as a
    /// cold cache instead of a failure.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            LifecycleError::Unauthorized { .. } | LifecycleError::ImageNotFound(_)
        )
    }

    /// Exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            LifecycleError::InvalidArgs(_) => exit_code::INVALID_ARGS,
            LifecycleError::Malformed(_) | LifecycleError::Config(_) => exit_code::INVALID_ENV,
            LifecycleError::ImageNotFound(_) => exit_code::NOT_FOUND,
            LifecycleError::Io { .. }
            | LifecycleError::IoError(_)
            | LifecycleError::Layer(_)
            | LifecycleError::LayerNotFound { .. }
            | LifecycleError::Assembly(_)
            | LifecycleError::LabelCollision { .. }
            | LifecycleError::UnsupportedMediaType(_) => exit_code::FAILED_BUILD,
            LifecycleError::Unauthorized { .. }
            | LifecycleError::Registry { .. }
            | LifecycleError::OciImage(_) => exit_code::FAILED_TRANSPORT,
            LifecycleError::Serialization(_) => exit_code::FAILED,
        }
    }
}

impl From<serde_json::Error> for LifecycleError {
    fn from(err: serde_json::Error) -> Self {
        LifecycleError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for LifecycleError {
    fn from(err: toml::ser::Error) -> Self {
        LifecycleError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LifecycleError {
    fn from(err: toml::de::Error) -> Self {
        LifecycleError::Malformed(err.to_string())
    }
}

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
