//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing or decoding records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Record is not valid JSON, or could not be serialized.
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Record parsed but lacks a required field.
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),

    /// Partial record grew past the configured cap.
    #[error("record too large: {size} bytes buffered without terminator (max: {max})")]
    RecordTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// True for errors that concern a single record and leave the stream usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::RecordTooLarge { .. })
    }
}
