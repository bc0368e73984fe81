//! Error types for the consistency-check library.

use thiserror::Error;

/// Main error type for consistency-check operations.
///
/// Hash mismatches are deliberately *not* represented here: a digest
/// mismatch is the core output of the system and is reported through the
/// health log, never raised as an error. Per-item anomalies (missing
/// records, missing index keys, malformed documents) are likewise absorbed
/// at the scan site; only interruption aborts a batch early, and even that
/// is caught at the verifier boundary.
#[derive(Error, Debug)]
pub enum CheckError {
    /// The operation was cancelled; observed at the next per-item check point.
    #[error("operation interrupted")]
    Interrupted,

    /// Configuration error (invalid YAML, out-of-range ceiling, etc.)
    #[error("configuration error: {0}")]
    Config(String),

    /// A named index does not exist at apply time.
    #[error("cannot find index {index} for ns {namespace}")]
    IndexNotFound { index: String, namespace: String },

    /// A wire descriptor could not be decoded into a canonical batch.
    #[error("malformed batch descriptor: {0}")]
    Descriptor(String),

    /// Error surfaced by a storage collaborator (cursor, record store, snapshot).
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored document failed structural validation.
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// IO error (config file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CheckError {
    /// Create a Storage error from any displayable collaborator failure.
    pub fn storage(message: impl Into<String>) -> Self {
        CheckError::Storage(message.into())
    }

    /// Create a Descriptor error.
    pub fn descriptor(message: impl Into<String>) -> Self {
        CheckError::Descriptor(message.into())
    }
}

/// Result type alias for consistency-check operations.
pub type Result<T> = std::result::Result<T, CheckError>;
