//! Turns handler results into reply envelopes.
//!
//! A plain value becomes one final envelope. A stream is pulled one value
//! ahead so the last value can travel on the final envelope:
//!
//! ```text
//! values:     a      b      c      <end>
//! envelopes:         {a}    {b}    {c, done}
//! ```
//!
//! An empty stream produces a single final envelope without content. If a
//! pull fails, the value held back so far goes out as a regular chunk,
//! followed by one final error envelope, and the stream is not pulled again.

use std::mem;

use futures_util::StreamExt;
use serde_json::Value;

use linemux_protocol::Envelope;

use crate::error::HandlerError;
use crate::registry::{HandlerOutput, HandlerResult, ReplyStream};

enum EncoderState {
    Single(Envelope),
    Streaming {
        values: ReplyStream,
        held: Option<Value>,
    },
    Failing(HandlerError),
    Finished,
}

/// Pull-based cursor over the envelopes for one handler result.
pub struct ReplyEncoder {
    state: EncoderState,
}

impl ReplyEncoder {
    /// Creates an encoder for `result`.
    pub fn new(result: HandlerResult) -> Self {
        let state = match result {
            Ok(HandlerOutput::Value(value)) => EncoderState::Single(Envelope::complete(Some(value))),
            Ok(HandlerOutput::Stream(values)) => EncoderState::Streaming { values, held: None },
            Err(err) => EncoderState::Failing(err),
        };
        Self { state }
    }

    /// Produces the next envelope, or `None` once the final one was returned.
    ///
    /// Dropping the encoder mid-stream stops pulling the underlying stream.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            match mem::replace(&mut self.state, EncoderState::Finished) {
                EncoderState::Finished => return None,
                EncoderState::Single(envelope) => return Some(envelope),
                EncoderState::Failing(err) => return Some(Envelope::failure(err.message())),
                EncoderState::Streaming { mut values, held } => match values.next().await {
                    Some(Ok(value)) => {
                        self.state = EncoderState::Streaming {
                            values,
                            held: Some(value),
                        };
                        if let Some(previous) = held {
                            return Some(Envelope::chunk(previous));
                        }
                    }
                    Some(Err(err)) => match held {
                        Some(previous) => {
                            self.state = EncoderState::Failing(err);
                            return Some(Envelope::chunk(previous));
                        }
                        None => return Some(Envelope::failure(err.message())),
                    },
                    None => return Some(Envelope::complete(held)),
                },
            }
        }
    }

    /// Returns true once the final envelope has been produced.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, EncoderState::Finished)
    }

    /// Drains every remaining envelope.
    pub async fn collect(mut self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Some(envelope) = self.next_envelope().await {
            envelopes.push(envelope);
        }
        envelopes
    }
}
