//! Store error types.
//!
//! - `NotFound`: no document with the requested name
//! - `AlreadyExists`: create of a name that is already taken
//! - `Serialization`: failed to encode/decode a stored document
//! - `Io`: underlying storage system errors

use thiserror::Error;

/// Errors that can occur during document store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Document not found
    #[error("document not found: {0}")]
    NotFound(String),

    /// Document name already taken
    #[error("document already exists: {0}")]
    AlreadyExists(String),

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
