//! Common error types for vaultsync.

use std::sync::Arc;
use thiserror::Error;

/// Top-level error type for sync operations.
///
/// The error is `Clone` so a single pass result can be handed to every
/// caller that was coalesced into that pass.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Remote store rejected or failed an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Network-class failure talking to the remote store.
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted in the current state or by the store.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The pass refused to continue because the remote state looks corrupt.
    #[error("Safety halt: {0}")]
    SafetyHalt(String),

    /// Cooperative cancellation was requested.
    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// Whether the error is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }

    /// Whether the error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
