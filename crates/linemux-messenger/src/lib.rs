//! Handler dispatch, request correlation and streaming replies over one
//! CRLF-delimited JSON byte stream.
//!
//! A [`Messenger`] owns the listener registry and the table of pending
//! requests. It can serve any `AsyncRead + AsyncWrite` stream; the
//! [`SocketServer`] and [`connect`] helpers wire it to TCP.
//!
//! # Example
//!
//! ```rust,no_run
//! use linemux_messenger::{HandlerError, HandlerOutput, Messenger, MessengerConfig, SocketServer};
//! use linemux_protocol::Message;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MessengerConfig::default();
//!     let messenger = Messenger::new(config.clone());
//!     messenger.on("echo", |message: Message| async move {
//!         Ok::<_, HandlerError>(HandlerOutput::Value(message.data))
//!     });
//!
//!     let server = SocketServer::bind(&config).await?;
//!     server.run(&messenger).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod correlation;
mod error;
mod messenger;
mod registry;
mod reply;
mod socket;

pub use config::{DEFAULT_PORT, MessengerConfig};
pub use correlation::CorrelationTable;
pub use error::{HandlerError, MessengerError, MessengerResult};
pub use messenger::{ErrorEvent, Messenger};
pub use registry::{
    BoxFuture, FnHandler, Handler, HandlerOutput, HandlerResult, ListenerRegistry, ReplyStream,
};
pub use reply::ReplyEncoder;
pub use socket::{SocketServer, connect};
