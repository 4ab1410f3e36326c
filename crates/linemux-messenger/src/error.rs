//! Messenger error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for messenger operations.
pub type MessengerResult<T> = Result<T, MessengerError>;

/// Errors that can occur in the messenger.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// IO error on the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, etc.).
    #[error("Protocol error: {0}")]
    Protocol(#[from] linemux_protocol::ProtocolError),

    /// No connection is attached to write to.
    #[error("Not connected")]
    NotConnected,

    /// A stream operation did not finish in time.
    #[error("Timeout during {operation}")]
    Timeout { operation: String },

    /// No reply arrived before the request timeout.
    #[error("Request {message_type}/{message_id} timed out after {timeout:?}")]
    RequestTimeout {
        message_type: String,
        message_id: String,
        timeout: Duration,
    },

    /// The pending request was dropped before a reply arrived.
    #[error("Request {message_id} was cancelled")]
    Cancelled { message_id: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl MessengerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a stream timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}

/// Failure raised by a message handler.
///
/// Only the description crosses the wire, as the `error` field of the final
/// reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the description.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}
