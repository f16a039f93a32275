//! Error types for courseware-storage

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("All blob backends failed: {}", .failures.join("; "))]
    ChainExhausted { failures: Vec<String> },

    #[error("Blob too large for {backend}: {size} bytes (limit {limit})")]
    TooLarge {
        backend: String,
        size: usize,
        limit: usize,
    },

    #[error("Invalid blob handle: {0}")]
    InvalidHandle(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Course not found: {0}")]
    CourseNotFound(String),

    #[error("Metadata index error: {0}")]
    Index(String),

    #[error("Blocks of lesson {lesson_id} are derived from its rich document and cannot be edited directly")]
    InconsistentLesson { lesson_id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub(crate) fn unavailable(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Integrity failures and missing handles are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. }
                | Self::ChainExhausted { .. }
                | Self::Timeout(_)
                | Self::Index(_)
                | Self::Io(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
