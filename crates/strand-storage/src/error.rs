//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The backend failed to read or write.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The store has been shut down.
    #[error("storage closed")]
    Closed,
}

/// A specialized Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
