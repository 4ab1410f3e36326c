//! Message and reply envelope types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolResult;

/// One record on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Selects the handlers on the receiving side.
    pub message_type: String,
    /// Correlation id, echoed back by replies.
    pub message_id: String,
    /// Payload.
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Creates a message.
    pub fn new(message_type: impl Into<String>, message_id: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            message_id: message_id.into(),
            data,
        }
    }

    /// Builds a reply to this message carrying `envelope`.
    pub fn reply(&self, envelope: &Envelope) -> Self {
        Self::new(
            self.message_type.clone(),
            self.message_id.clone(),
            envelope.to_value(),
        )
    }
}

/// Outcome carried by an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Handler produced a value.
    Success,
    /// Handler failed; the envelope carries `error`.
    Error,
}

/// Reply payload sent back for a dispatched message.
///
/// A reply is one or more envelopes sharing the request's id. Only the last
/// one has `done` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Whether this is the final envelope for the call.
    pub done: bool,
    /// Success or error.
    pub status: ReplyStatus,
    /// Produced value. Absent on errors and on empty streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Failure description, only set when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Non-final envelope of a streaming reply.
    pub fn chunk(content: Value) -> Self {
        Self {
            done: false,
            status: ReplyStatus::Success,
            content: Some(content),
            error: None,
        }
    }

    /// Final successful envelope.
    pub fn complete(content: Option<Value>) -> Self {
        Self {
            done: true,
            status: ReplyStatus::Success,
            content,
            error: None,
        }
    }

    /// Final error envelope.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            done: true,
            status: ReplyStatus::Error,
            content: None,
            error: Some(error.into()),
        }
    }

    /// Returns true if the envelope reports success.
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    /// Parses an envelope out of a reply's `data`.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Converts the envelope into a `data` value.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("done".into(), Value::Bool(self.done));
        let status = match self.status {
            ReplyStatus::Success => "success",
            ReplyStatus::Error => "error",
        };
        map.insert("status".into(), Value::String(status.into()));
        if let Some(ref content) = self.content {
            map.insert("content".into(), content.clone());
        }
        if let Some(ref error) = self.error {
            map.insert("error".into(), Value::String(error.clone()));
        }
        Value::Object(map)
    }
}
