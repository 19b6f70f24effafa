//! Network error types.

use thiserror::Error;

/// Errors that can occur in the tracker, the node or the transport.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Peer not found.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] strand_protocol::ProtocolError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] strand_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The node or tracker is not running.
    #[error("not running")]
    NotRunning,

    /// The connection's outbound channel is closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// A specialized Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
