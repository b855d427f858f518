/// Streamconn Error Types
///
/// Errors surfaced by bind, connect and socket operations. Per-connection
/// I/O failures inside the poll loop never show up here; they drive the
/// connection state machine instead.

use std::io;
use thiserror::Error;

use crate::endpoint::EndpointError;

/// Main error type for streamconn operations
#[derive(Error, Debug)]
pub enum StreamError {
    /// IO error during socket or poller operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Endpoint string could not be parsed
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// TLS configuration or session error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Endpoint already has a listening socket
    #[error("Endpoint already bound: {0}")]
    AlreadyBound(String),

    /// Connection was disconnected and removed from its container
    #[error("Connection {0} closed")]
    ConnectionClosed(u64),

    /// Container used before `init`
    #[error("Container not initialized")]
    NotInitialized,

    /// Poll loop has stopped; nothing new can be bound or connected
    #[error("Poller loop terminated")]
    PollerTerminated,
}

/// Result type alias for streamconn operations
pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// Create a TLS error with a message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_) | Self::PollerTerminated)
    }
}

impl From<rustls::Error> for StreamError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}
