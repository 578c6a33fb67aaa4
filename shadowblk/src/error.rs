//! Error types for shadowblk.

use std::io;

use thiserror::Error;

// Re-export wire protocol violations from the nbd-wire crate
pub use nbd_wire::WireError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("nbd protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("write queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

/// Write-queue publisher errors.
///
/// Only `Io` errors of the EOF/reset class are survivable (the worker
/// reconnects); everything else is fatal to the process because no partial
/// publisher state is safe to continue from.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to write queue: {0}")]
    Connect(io::Error),

    #[error("write queue i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("write queue server error: {0}")]
    Server(String),

    #[error("malformed write queue reply: {0}")]
    Protocol(&'static str),
}

impl QueueError {
    /// True for the disconnect class a queue server produces when it times
    /// out an idle connection. These are handled by reconnecting.
    pub fn is_timeout_class(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_class_covers_eof_and_reset() {
        let eof = QueueError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        let reset = QueueError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(eof.is_timeout_class());
        assert!(reset.is_timeout_class());
    }

    #[test]
    fn refused_connect_and_server_errors_are_fatal() {
        let refused = QueueError::Connect(io::Error::from(io::ErrorKind::ConnectionRefused));
        let server = QueueError::Server("ERR invalid DB index".to_string());
        assert!(!refused.is_timeout_class());
        assert!(!server.is_timeout_class());
    }
}
