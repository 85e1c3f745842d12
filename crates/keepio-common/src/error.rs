//! Error types for KeepIO
//!
//! This module defines the common error types used throughout the system.

use std::sync::Arc;
use thiserror::Error;

/// Common result type for KeepIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for KeepIO
///
/// `Clone` so that a single remote fetch can hand its outcome to every
/// reader waiting on it.
#[derive(Clone, Debug, Error)]
pub enum Error {
    // Block lifecycle errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient replicas: stored {achieved} of {wanted}")]
    InsufficientReplicas { achieved: usize, wanted: usize },

    #[error("volume is read-only: {0}")]
    MethodDisabled(String),

    #[error("trash is disabled (trash lifetime is zero and unsafe delete is off): {0}")]
    TrashDisabled(String),

    #[error("{key}: block is already in trash and its safe window has ended")]
    TrashRace { key: String },

    // Backend errors
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("permanent backend error: {0}")]
    Permanent(String),

    // Integrity errors
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    // Control flow
    #[error("operation cancelled")]
    Cancelled,

    // Local errors
    #[error("disk I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a transient backend error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent backend error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map an I/O error on `what`, turning `ENOENT` into `NotFound`
    pub fn from_io(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(what.to_string())
        } else {
            Self::Io(Arc::new(err))
        }
    }

    /// Check if the caller may retry this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Io(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is a cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
