//! Record encoding and decoding.

use std::borrow::Cow;

use serde::Deserialize;
use serde_json::Value;

use crate::RECORD_TERMINATOR;
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::Message;

/// Longest record rendered in full by [`truncate_for_log`].
const LOG_RECORD_LIMIT: usize = 200;
/// Characters kept from each end of a truncated record.
const LOG_RECORD_EDGE: usize = 100;

/// Decoding target with every field optional, so missing fields can be
/// reported by name instead of as a generic serde error.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    message_type: Option<String>,
    message_id: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Decodes one record (without its terminator) into a [`Message`].
///
/// # Example
///
/// ```rust
/// use linemux_protocol::{decode_record, ProtocolError};
///
/// let message = decode_record(br#"{"messageType":"ping","messageId":"1"}"#).unwrap();
/// assert_eq!(message.message_type, "ping");
/// assert!(message.data.is_null());
///
/// let err = decode_record(br#"{"messageType":"ping"}"#).unwrap_err();
/// assert!(matches!(err, ProtocolError::MissingField("messageId")));
/// ```
pub fn decode_record(record: &[u8]) -> ProtocolResult<Message> {
    let raw: RawMessage = serde_json::from_slice(record)?;
    let message_type = raw
        .message_type
        .ok_or(ProtocolError::MissingField("messageType"))?;
    let message_id = raw
        .message_id
        .ok_or(ProtocolError::MissingField("messageId"))?;
    Ok(Message {
        message_type,
        message_id,
        data: raw.data,
    })
}

/// Encodes a message as one terminated record.
pub fn encode_record(message: &Message) -> ProtocolResult<Vec<u8>> {
    let mut buffer = serde_json::to_vec(message)?;
    buffer.extend_from_slice(RECORD_TERMINATOR);
    Ok(buffer)
}

/// Shortens a record for log output, keeping both ends.
pub fn truncate_for_log(record: &str) -> Cow<'_, str> {
    let count = record.chars().count();
    if count <= LOG_RECORD_LIMIT {
        return Cow::Borrowed(record);
    }
    let head: String = record.chars().take(LOG_RECORD_EDGE).collect();
    let tail: String = record.chars().skip(count - LOG_RECORD_EDGE).collect();
    Cow::Owned(format!("{head}...{tail}"))
}
