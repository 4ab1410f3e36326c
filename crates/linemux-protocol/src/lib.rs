//! Wire protocol for linemux.
//!
//! # Protocol Overview
//!
//! Records are UTF-8 JSON objects terminated by `\r\n`. There is no length
//! prefix, record boundaries are found by scanning for the terminator. JSON
//! escapes control characters, so the terminator never occurs inside a
//! record.
//!
//! Every record has three top-level fields:
//! - `messageType`: selects the handlers on the receiving side
//! - `messageId`: correlates replies with the request that caused them
//! - `data`: arbitrary payload
//!
//! Replies reuse the request's type and id and carry an [`Envelope`] in
//! `data`.
//!
//! # Example
//!
//! ```rust
//! use linemux_protocol::{FrameReassembler, Message, decode_record, encode_record};
//!
//! let message = Message::new("ping", "1", serde_json::json!({}));
//! let bytes = encode_record(&message).unwrap();
//!
//! let mut frames = FrameReassembler::new(1024);
//! let records: Vec<_> = frames.feed(&bytes).unwrap().collect();
//! assert_eq!(decode_record(&records[0]).unwrap(), message);
//! ```

mod codec;
mod error;
mod framing;
mod types;

pub use codec::{decode_record, encode_record, truncate_for_log};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReassembler, Records};
pub use types::{Envelope, Message, ReplyStatus};

/// Record terminator.
pub const RECORD_TERMINATOR: &[u8] = b"\r\n";

/// Default cap on a buffered partial record (1 MB).
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;
