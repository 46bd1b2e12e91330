use thiserror::Error;

/// Bundle graph error types
#[derive(Error, Debug)]
pub enum BundleError {
    /// A plain image or index was supplied where a bundle was expected
    #[error("Not a bundle: {reference}{}", hint_suffix(.hint))]
    NotABundle {
        reference: String,
        hint: Option<String>,
    },

    /// The artifact (or cache entry) does not exist at the given location
    #[error("Artifact not found: {reference} - {message}")]
    ArtifactNotFound { reference: String, message: String },

    /// The registry refused access to the artifact
    #[error("Access denied: {reference} - {message}")]
    AccessDenied { reference: String, message: String },

    /// An invariant of the resolved graph was violated
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// A versioned document carries an apiVersion/kind this build cannot read
    #[error("Unsupported {kind} version: found '{found}', expected '{expected}'")]
    UnsupportedVersion {
        kind: String,
        found: String,
        expected: String,
    },

    /// An artifact has no known location
    #[error("No locations known for artifact {0}")]
    EmptyLocations(String),

    /// Malformed image reference
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// The walk was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl BundleError {
    /// Whether this error means "the artifact is not at this location".
    pub fn is_not_found(&self) -> bool {
        matches!(self, BundleError::ArtifactNotFound { .. })
    }

    /// Not found or not accessible. Location probing treats both as absent.
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            BundleError::ArtifactNotFound { .. } | BundleError::AccessDenied { .. }
        )
    }

    /// Whether this error reports a defect rather than an environmental failure.
    pub fn is_defect(&self) -> bool {
        matches!(self, BundleError::InternalInconsistency(_))
    }

    /// Corrective hint attached to user-facing errors.
    pub fn hint(&self) -> Option<&str> {
        match self {
            BundleError::NotABundle { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BundleError {
    fn from(err: serde_json::Error) -> Self {
        BundleError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BundleError {
    fn from(err: serde_yaml::Error) -> Self {
        BundleError::SerializationError(err.to_string())
    }
}

/// Result type alias for bundle graph operations
pub type Result<T> = std::result::Result<T, BundleError>;

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_ref()
        .map(|hint| format!(" ({})", hint))
        .unwrap_or_default()
}
