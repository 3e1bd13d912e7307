//! Error types for storage engine operations

use thiserror::Error;

/// Main error type for storage engine operations.
///
/// Variants map one-to-one onto the engine's error taxonomy: every failure a
/// caller can observe is one of these six kinds. Filesystem and codec errors
/// propagate unchanged; nothing is retried internally.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Bad coordinates, unknown attribute, domain mismatch, malformed subarray.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Array already exists, or an open with an incompatible schema.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    /// Filesystem failure, with the underlying backend message and path.
    #[error("io error [{path}]: {message}")]
    Io { path: String, message: String },

    /// Magic/version mismatch, offset out of range, decompression failure.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Buffer size exceeded, or a tile too large for backend block limits.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Operation the active backend cannot perform.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl StorageError {
    /// Attach a path to a raw backend error.
    pub fn io(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StorageError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Specialized Result type for storage engine operations.
pub type Result<T> = std::result::Result<T, StorageError>;
