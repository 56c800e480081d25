//! Error types for cachewire.

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid argument (constructor parameter out of range, dead handoff
    /// connection).
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// A role-scoped method was called in the wrong role.
    #[error("state misuse: {0}")]
    StateMisuse(String),

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (invalid frame length, correlation id collision).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation unblocked because the transport was closed.
    #[error("operation canceled")]
    Canceled,

    /// Connection closed while a send or receive was pending.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;
