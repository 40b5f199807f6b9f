//! Server error types.
//!
//! Domain failures (wrong password, stale version, no session) are replies,
//! not errors. The types here cover broken driver invariants, store failures
//! that escape a request, and runtime I/O.

use std::fmt;

use crate::{registry::PeerId, storage::StoreError};

/// Errors from the Sans-IO driver.
#[derive(Debug)]
pub enum DriverError {
    /// Peer not found in registry.
    ///
    /// An event arrived for a connection that was never accepted or has
    /// already been closed.
    PeerNotFound(PeerId),

    /// Peer already registered.
    ///
    /// Peer IDs are unique for the life of the process, so this is a runtime
    /// bug.
    PeerAlreadyExists(PeerId),

    /// Store operation failed outside of a request.
    Store(StoreError),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerNotFound(id) => write!(f, "peer not found: {id}"),
            Self::PeerAlreadyExists(id) => write!(f, "peer already exists: {id}"),
            Self::Store(err) => write!(f, "store error: {err}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for DriverError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Errors that can occur in the server runtime.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, unusable data path).
    ///
    /// Fatal: prevents server startup.
    Config(String),

    /// Transport/network error (bind failure, socket I/O).
    Transport(String),

    /// Driver error (from `ServerDriver` processing).
    Driver(DriverError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Driver(err) => write!(f, "driver error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Driver(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DriverError> for ServerError {
    fn from(err: DriverError) -> Self {
        Self::Driver(err)
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
