//! Pending requests keyed by message id.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::warn;

use linemux_protocol::Message;

/// One-shot continuations waiting for a reply with a given id.
///
/// Each entry fires at most once: resolving removes it, so later messages
/// with the same id find nothing here.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl CorrelationTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `continuation` under `message_id`, replacing any previous entry.
    pub fn register(&self, message_id: impl Into<String>, continuation: oneshot::Sender<Message>) {
        let message_id = message_id.into();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.insert(message_id.clone(), continuation).is_some() {
            warn!(message_id = %message_id, "Replaced pending request with a reused id");
        }
    }

    /// Hands `message` to the continuation waiting for its id.
    ///
    /// Returns the message back when nobody is waiting for it. A continuation
    /// whose caller has gone away still counts as resolved.
    pub fn resolve(&self, message: Message) -> Option<Message> {
        let continuation = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message.message_id);
        match continuation {
            Some(continuation) => {
                let _ = continuation.send(message);
                None
            }
            None => Some(message),
        }
    }

    /// Drops the entry for `message_id` without firing it.
    pub fn cancel(&self, message_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(message_id)
            .is_some()
    }

    /// Returns true if a request with `message_id` is waiting.
    pub fn contains(&self, message_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(message_id)
    }

    /// Number of requests waiting for a reply.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no request is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a pending entry when the waiting request goes away, whether it
/// was answered, timed out or dropped.
pub(crate) struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    message_id: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a CorrelationTable, message_id: String) -> Self {
        Self { table, message_id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(&self.message_id);
    }
}
