//! Listener registry: message type to handlers.
//!
//! Several handlers may listen to the same type. An inbound message is
//! broadcast to all of them, each in its own task, and the dispatcher never
//! waits for any of them. Two messages are therefore not guaranteed to finish
//! handling in arrival order. Callers needing that must sequence externally.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::{FutureExt, Stream, stream};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use linemux_protocol::Message;

use crate::error::HandlerError;

/// Boxed future for handler results.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Values produced one at a time by a streaming handler.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Value, HandlerError>> + Send + 'static>>;

/// Result type for handler functions.
pub type HandlerResult = Result<HandlerOutput, HandlerError>;

/// What a handler hands back for encoding.
pub enum HandlerOutput {
    /// A single value, sent as one final envelope.
    Value(Value),
    /// A sequence of values, sent as a streaming reply.
    Stream(ReplyStream),
}

impl HandlerOutput {
    /// Serializes `value` into a single-value output.
    pub fn value<T: Serialize>(value: T) -> HandlerResult {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    /// Wraps a stream of values.
    pub fn stream<S>(values: S) -> Self
    where
        S: Stream<Item = Result<Value, HandlerError>> + Send + 'static,
    {
        Self::Stream(Box::pin(values))
    }

    /// Streams already computed values.
    pub fn iter<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::stream(stream::iter(values.into_iter().map(Ok)))
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A message handler.
pub trait Handler: Send + Sync + 'static {
    /// Handles one inbound message.
    fn call(&self, message: Message) -> BoxFuture<HandlerResult>;
}

/// Adapts an async function or closure into a [`Handler`].
pub struct FnHandler<F> {
    handler: F,
}

impl<F> FnHandler<F> {
    /// Wraps `handler`.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, message: Message) -> BoxFuture<HandlerResult> {
        Box::pin((self.handler)(message))
    }
}

/// Ordered handlers per message type. Append-only.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn Handler>>>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the list for `message_type`.
    pub fn register(&self, message_type: impl Into<String>, handler: Arc<dyn Handler>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(message_type.into())
            .or_default()
            .push(handler);
    }

    /// Snapshot of the handlers for `message_type`, in registration order.
    pub fn handlers(&self, message_type: &str) -> Vec<Arc<dyn Handler>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of handlers registered for `message_type`.
    pub fn handler_count(&self, message_type: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .map_or(0, Vec::len)
    }

    /// Starts every handler for `message.message_type` as its own task.
    ///
    /// `on_result` runs in the handler's task once the handler returns.
    /// Nothing is joined. Returns the number of tasks started.
    pub fn dispatch_all<F, Fut>(&self, message: &Message, on_result: F) -> usize
    where
        F: Fn(Message, HandlerResult) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handlers = self.handlers(&message.message_type);
        for handler in &handlers {
            let handler = Arc::clone(handler);
            let message = message.clone();
            let on_result = on_result.clone();
            tokio::spawn(async move {
                let result = call_isolated(handler.as_ref(), message.clone()).await;
                on_result(message, result).await;
            });
        }
        handlers.len()
    }

    /// Runs only the first handler for `message_type`, or returns `None`
    /// when nothing is registered.
    pub fn invoke_first(
        &self,
        message_type: &str,
        message: Message,
    ) -> Option<BoxFuture<HandlerResult>> {
        let handler = self.handlers(message_type).into_iter().next()?;
        Some(Box::pin(async move {
            call_isolated(handler.as_ref(), message).await
        }))
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for (message_type, handlers) in listeners.iter() {
            map.entry(message_type, &handlers.len());
        }
        map.finish()
    }
}

/// Calls a handler, turning a panic into a handler error.
async fn call_isolated(handler: &dyn Handler, message: Message) -> HandlerResult {
    let message_type = message.message_type.clone();
    match AssertUnwindSafe(async { handler.call(message).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(message_type = %message_type, "Handler panicked");
            Err(HandlerError::new("handler panicked"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    fn tagged(tag: &'static str) -> Arc<dyn Handler> {
        Arc::new(FnHandler::new(move |_message: Message| async move {
            Ok::<_, HandlerError>(HandlerOutput::Value(json!(tag)))
        }))
    }

    fn content(result: HandlerResult) -> Value {
        match result {
            Ok(HandlerOutput::Value(value)) => value,
            other => panic!("unexpected handler result: {other:?}"),
        }
    }

    #[test]
    fn register_appends_in_order() {
        let registry = ListenerRegistry::new();
        assert_eq!(registry.handler_count("ping"), 0);

        registry.register("ping", tagged("first"));
        registry.register("ping", tagged("second"));
        registry.register("other", tagged("third"));

        assert_eq!(registry.handler_count("ping"), 2);
        assert_eq!(registry.handler_count("other"), 1);
        assert_eq!(registry.handlers("missing").len(), 0);
    }

    #[tokio::test]
    async fn invoke_first_uses_first_registration() {
        let registry = ListenerRegistry::new();
        registry.register("ping", tagged("first"));
        registry.register("ping", tagged("second"));

        let result = registry
            .invoke_first("ping", Message::new("ping", "1", Value::Null))
            .unwrap()
            .await;
        assert_eq!(content(result), json!("first"));
    }

    #[tokio::test]
    async fn invoke_first_without_handler_is_none() {
        let registry = ListenerRegistry::new();
        assert!(
            registry
                .invoke_first("ping", Message::new("ping", "1", Value::Null))
                .is_none()
        );
    }

    #[tokio::test]
    async fn dispatch_all_reaches_every_handler() {
        let registry = ListenerRegistry::new();
        registry.register("ping", tagged("first"));
        registry.register("ping", tagged("second"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = registry.dispatch_all(&Message::new("ping", "9", Value::Null), {
            move |message: Message, result: HandlerResult| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((message.message_id, content(result)));
                }
            }
        });
        assert_eq!(started, 2);

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|(_, tag)| tag.to_string());
        assert_eq!(
            seen,
            vec![
                ("9".to_string(), json!("first")),
                ("9".to_string(), json!("second")),
            ]
        );
    }

    #[tokio::test]
    async fn blocked_handler_does_not_hold_up_others() {
        let registry = ListenerRegistry::new();
        let gate = Arc::new(Notify::new());
        let blocked_gate = Arc::clone(&gate);
        registry.register(
            "work",
            Arc::new(FnHandler::new(move |_message: Message| {
                let gate = Arc::clone(&blocked_gate);
                async move {
                    gate.notified().await;
                    Ok::<_, HandlerError>(HandlerOutput::Value(json!("slow")))
                }
            })),
        );
        registry.register("work", tagged("fast"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.dispatch_all(&Message::new("work", "1", Value::Null), {
            move |_message: Message, result: HandlerResult| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(content(result));
                }
            }
        });

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, json!("fast"));

        gate.notify_one();
        assert_eq!(rx.recv().await.unwrap(), json!("slow"));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_error() {
        let registry = ListenerRegistry::new();
        registry.register(
            "boom",
            Arc::new(FnHandler::new(|_message: Message| async move {
                if true {
                    panic!("handler bug");
                }
                Ok::<_, HandlerError>(HandlerOutput::Value(Value::Null))
            })),
        );

        let result = registry
            .invoke_first("boom", Message::new("boom", "1", Value::Null))
            .unwrap()
            .await;
        assert_eq!(result.unwrap_err().message(), "handler panicked");
    }

    #[test]
    fn value_helper_serializes() {
        #[derive(Serialize)]
        struct Pong {
            ok: bool,
        }
        assert_eq!(
            content(HandlerOutput::value(Pong { ok: true })),
            json!({"ok": true})
        );
    }
}
