//! Error types for objwire.

use thiserror::Error;

/// Message reported through `on_error` when the peer closes the link.
pub const DISCONNECTED: &str = "disconnected";

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Address scheme has no transport (including `wss`, TLS is not provided).
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// WebSocket handshake or framing error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Error raised by the session while consuming incoming data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connect did not complete within the configured timeout.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// The connection attempt was cancelled before it completed.
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
