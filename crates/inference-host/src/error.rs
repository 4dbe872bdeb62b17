//! Error types for model lifecycle operations.

use thiserror::Error;

/// The four failure kinds a caller of the manager can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No resolvable artifact.
    NotFound,
    /// Artifact found but the runtime could not be constructed.
    Load,
    /// Remote listing or transfer failed.
    Download,
    /// The host cannot run the requested backend kind.
    PlatformIncompatible,
}

/// Errors that can occur while resolving, loading or tearing down a model.
#[derive(Debug, Error)]
pub enum HostError {
    /// No artifact could be resolved for the request.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The artifact exists but the runtime failed to start, or the backend is unsupported.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// Hub listing or file transfer failed.
    #[error("Failed to download model: {0}")]
    ModelDownload(String),

    /// The backend kind cannot run on this host.
    #[error("Platform incompatible: {0}")]
    PlatformIncompatible(String),

    /// Another load is still in flight.
    #[error("A model is already being loaded")]
    ConcurrentLoad,

    /// Hub-native manifest file is missing.
    #[error("Manifest file not found at: {0}")]
    ManifestNotFound(String),

    /// Hub-native manifest has no model payload layer.
    #[error("No model layer found in manifest: {0}")]
    ManifestLayerMissing(String),

    /// Digest in the manifest points at a blob that is not on disk.
    #[error("Model blob not found at: {0}")]
    BlobNotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HostError {
    /// Caller-visible category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::ModelNotFound(_) => ErrorKind::NotFound,
            HostError::ModelDownload(_) => ErrorKind::Download,
            HostError::PlatformIncompatible(_) => ErrorKind::PlatformIncompatible,
            HostError::ModelLoad(_)
            | HostError::ConcurrentLoad
            | HostError::ManifestNotFound(_)
            | HostError::ManifestLayerMissing(_)
            | HostError::BlobNotFound(_)
            | HostError::Io(_)
            | HostError::Http(_)
            | HostError::Json(_) => ErrorKind::Load,
        }
    }

    /// Whether this error belongs to the domain taxonomy and may cross the
    /// manager boundary untouched.
    pub fn is_domain(&self) -> bool {
        !matches!(self, HostError::Io(_) | HostError::Http(_) | HostError::Json(_))
    }

    /// Re-wrap anything outside the domain taxonomy as `ModelLoad`,
    /// keeping the original message.
    pub fn into_domain(self) -> HostError {
        if self.is_domain() {
            self
        } else {
            HostError::ModelLoad(self.to_string())
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
