//! Protocol error types.
//!
//! Every variant is recoverable: the decoder reports it, abandons the partial
//! message, and resynchronizes on the next command line. None of these close
//! the connection.

use thiserror::Error;

/// Errors produced while decoding the inbound byte stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A line arrived while waiting for a command, and it is not one of the
    /// request keywords.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// The line is shorter than the delimiter of the expected token.
    #[error("line too short for expected token {expected:?}")]
    LineTooShort {
        /// Delimiter that was expected (e.g. `Name:`)
        expected: &'static str,
    },

    /// The line does not start with the delimiter of the expected token.
    #[error("expected token {expected:?}, got {found:?}")]
    UnexpectedToken {
        /// Delimiter that was expected (e.g. `Version:`)
        expected: &'static str,
        /// The offending line
        found: String,
    },

    /// `Length:` value is not a non-negative integer.
    #[error("invalid blob length: {0:?}")]
    InvalidLength(String),

    /// `Length:` value exceeds the configured blob limit.
    #[error("blob too large: {size} bytes (max {max})")]
    BlobTooLarge {
        /// Announced size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// A line grew past the configured line limit before its terminator.
    #[error("line exceeds {max} bytes")]
    LineTooLong {
        /// Configured maximum
        max: usize,
    },

    /// A line or blob is not valid UTF-8.
    #[error("invalid UTF-8 in input")]
    InvalidUtf8,
}

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, DecodeError>;
