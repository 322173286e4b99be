//! Storage error types

use std::io;
use std::path::Path;

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur reading or writing persisted state
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem access failed
    #[error("storage io on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A persisted record failed to serialize or deserialize
    #[error("record codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// A frame is truncated or its length prefix disagrees with the payload
    #[error("corrupt frame: {reason}")]
    CorruptFrame { reason: String },

    /// The external restricted store reported a failure
    #[error("restricted store: {0}")]
    Store(String),
}

impl StorageError {
    /// Create an Io error from a path and source
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Create a CorruptFrame error
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptFrame {
            reason: reason.into(),
        }
    }

    /// Create a restricted-store failure
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}
