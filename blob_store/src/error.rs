//! Error types for blob store operations.

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob store operations.
///
/// A missing key on delete is not an error and has no variant here.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BlobError {
    /// Transport, auth or timeout failure. Retryable.
    #[error("storage unavailable for key '{key}': {source}")]
    StorageUnavailable {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The key already exists and overwrite is disallowed.
    #[error("blob already exists: {key}")]
    WriteConflict { key: String },

    /// Blob not found on read.
    #[error("blob not found: {key}")]
    NotFound { key: String },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("unsupported blob storage backend: {scheme}")]
    UnsupportedBackend { scheme: String },

    #[error("invalid blob storage config: {reason}")]
    InvalidConfig { reason: String },
}

impl BlobError {
    pub fn unavailable(key: &str, source: impl Into<anyhow::Error>) -> Self {
        BlobError::StorageUnavailable {
            key: key.to_string(),
            source: source.into(),
        }
    }

    /// Identifies failures that may succeed when retried unchanged.
    ///
    /// Only `Self::StorageUnavailable` is retryable; a `WriteConflict` needs a
    /// new key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }

    /// Maps an `object_store` error for `key`.
    ///
    /// Not found and already exists keep their meaning, everything else is
    /// treated as the store being unavailable.
    pub(crate) fn from_object_store(key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => BlobError::NotFound {
                key: key.to_string(),
            },
            object_store::Error::AlreadyExists { .. } |
            object_store::Error::Precondition { .. } => BlobError::WriteConflict {
                key: key.to_string(),
            },
            object_store::Error::InvalidPath { source } => BlobError::InvalidKey {
                key: key.to_string(),
                reason: source.to_string(),
            },
            other => BlobError::unavailable(key, other),
        }
    }
}

impl From<url::ParseError> for BlobError {
    fn from(err: url::ParseError) -> Self {
        BlobError::InvalidConfig {
            reason: err.to_string(),
        }
    }
}
