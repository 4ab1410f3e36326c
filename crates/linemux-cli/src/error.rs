//! CLI error types.

use std::fmt;

use linemux_core::TracingError;
use linemux_messenger::MessengerError;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that can occur in the CLI.
#[derive(Debug)]
pub enum CliError {
    /// Configuration error.
    Config(String),
    /// Invalid command-line input.
    Usage(String),
    /// IO error.
    Io(std::io::Error),
    /// Logging could not be set up.
    Tracing(TracingError),
    /// The messenger failed.
    Messenger(MessengerError),
    /// The peer answered with an error envelope.
    Remote(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Usage(msg) => write!(f, "invalid input: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Tracing(err) => write!(f, "logging setup failed: {}", err),
            Self::Messenger(err) => write!(f, "{}", err),
            Self::Remote(msg) => write!(f, "remote handler failed: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Tracing(err) => Some(err),
            Self::Messenger(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<TracingError> for CliError {
    fn from(err: TracingError) -> Self {
        Self::Tracing(err)
    }
}

impl From<MessengerError> for CliError {
    fn from(err: MessengerError) -> Self {
        Self::Messenger(err)
    }
}
