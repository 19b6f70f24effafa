//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope or its payload is malformed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The envelope exceeds size limits.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge {
        /// The actual size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// The envelope carries a version this build cannot read.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    /// The envelope carries an unknown message type code.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
