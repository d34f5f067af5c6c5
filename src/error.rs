//! Error types for leafnet.

use thiserror::Error;

/// Main error type for all leafnet operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON error (configuration files only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (frame too short or too long, malformed body, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame carried an identifier with no registry entry.
    #[error("message id {0} not registered")]
    UnknownMessageId(u16),

    /// A message type was never registered with the processor.
    #[error("message {0} not registered")]
    NotRegistered(String),

    /// The connection is closed; nothing more can be written or read.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The outbound queue was full and the connection has been force-closed.
    #[error("Write queue full, connection closed")]
    QueueFull,

    /// The router queue was full and the message was dropped.
    #[error("Router queue full, dropped message {0}")]
    RouterFull(String),

    /// The router is no longer running.
    #[error("Router closed")]
    RouterClosed,

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias using NetError.
pub type Result<T> = std::result::Result<T, NetError>;
