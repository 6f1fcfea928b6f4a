//! Error types for the MAPI protocol implementation.

use std::io;

use thiserror::Error;

/// Result type for MAPI operations.
pub type MapiResult<T> = Result<T, MapiError>;

/// Errors that can occur while talking to a MonetDB server.
#[derive(Error, Debug)]
pub enum MapiError {
    /// I/O error on the socket (dial, read or write).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Login negotiation failed.
    #[error("Login failed: {0}")]
    Login(String),

    /// Malformed block, unknown response marker, bad challenge, etc.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected a command.
    #[error("{message}")]
    Server {
        /// SQLSTATE, when the server sent one.
        code: Option<String>,
        message: String,
    },

    /// A value could not be converted to or from its wire literal.
    #[error("Value conversion error: {0}")]
    Value(String),

    /// The caller misused the API. Raised locally, nothing was sent.
    #[error("{0}")]
    Usage(String),

    /// The connection is closed or was never logged in.
    #[error("Connection is closed")]
    ConnectionClosed,
}

impl MapiError {
    /// Whether the connection this error came from must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MapiError::Io(_)
                | MapiError::Login(_)
                | MapiError::Protocol(_)
                | MapiError::ConnectionClosed
        )
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        MapiError::Usage(msg.into())
    }
}
