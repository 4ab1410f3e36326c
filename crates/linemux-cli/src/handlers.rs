//! Built-in handlers registered by `linemux serve`.
//!
//! - `ping`: replies `"pong"`.
//! - `echo`: replies with the request payload.
//! - `count`: streams `1..=n`. The payload is either `n` or
//!   `{"to": n, "delay_ms": m}`.

use std::time::Duration;

use futures_util::stream;
use serde::Deserialize;
use serde_json::{Value, json};

use linemux_messenger::{HandlerError, HandlerOutput, HandlerResult, Messenger};
use linemux_protocol::Message;

/// Largest `n` accepted by `count`.
pub const MAX_COUNT: u64 = 10_000;

/// Registers `ping`, `echo` and `count` on `messenger`.
pub fn register_builtin(messenger: &Messenger) {
    messenger.on("ping", ping);
    messenger.on("echo", echo);
    messenger.on("count", count);
}

async fn ping(_message: Message) -> HandlerResult {
    Ok(HandlerOutput::Value(json!("pong")))
}

async fn echo(message: Message) -> HandlerResult {
    Ok(HandlerOutput::Value(message.data))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CountRequest {
    Plain(u64),
    Detailed {
        to: u64,
        #[serde(default)]
        delay_ms: u64,
    },
}

async fn count(message: Message) -> HandlerResult {
    let request = CountRequest::deserialize(&message.data)
        .map_err(|_| HandlerError::new("count expects a non-negative integer or {\"to\": n}"))?;
    let (to, delay) = match request {
        CountRequest::Plain(to) => (to, Duration::ZERO),
        CountRequest::Detailed { to, delay_ms } => (to, Duration::from_millis(delay_ms)),
    };
    if to > MAX_COUNT {
        return Err(HandlerError::new(format!("count is limited to {MAX_COUNT}")));
    }

    let values = stream::unfold(1u64, move |next| async move {
        if next > to {
            return None;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Some((Ok::<Value, HandlerError>(json!(next)), next + 1))
    });
    Ok(HandlerOutput::stream(values))
}
