//! Error types for Passage

use thiserror::Error;

/// Main error type for Passage
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Not allowed: {0}")]
    NotAllowed(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Connection closed")]
    Closed,

    #[error("Session is dead")]
    SessionDead,

    #[error("Virtual interface error")]
    Tun,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl Error {
    /// True when the error means the stream or listener is gone for good.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Closed | Error::SessionDead => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Result type alias for Passage
pub type Result<T> = std::result::Result<T, Error>;
