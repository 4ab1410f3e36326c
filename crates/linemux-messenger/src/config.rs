//! Messenger configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use linemux_protocol::DEFAULT_MAX_RECORD_SIZE;

use crate::error::{MessengerError, MessengerResult};

/// Default TCP port for [`crate::SocketServer`].
pub const DEFAULT_PORT: u16 = 3000;

/// Messenger configuration.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Address the socket server listens on.
    pub bind_addr: SocketAddr,

    /// Cap on a partial record waiting for its terminator.
    pub max_record_size: usize,

    /// How long `request` waits for a reply. `None` waits forever.
    pub request_timeout: Option<Duration>,

    /// Limit for writing one record to the stream.
    pub write_timeout: Duration,

    /// Size of the read buffer handed to the transport.
    pub read_buffer_size: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            request_timeout: Some(Duration::from_secs(30)),
            write_timeout: Duration::from_secs(30),
            read_buffer_size: 8 * 1024,
        }
    }
}

impl MessengerConfig {
    /// Creates a configuration listening on `bind_addr`.
    pub fn new(bind_addr: impl Into<SocketAddr>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    /// Builder: set the partial record cap.
    pub fn with_max_record_size(mut self, max: usize) -> Self {
        self.max_record_size = max;
        self
    }

    /// Builder: set or disable the request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builder: set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Builder: set the read buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Rejects settings the messenger cannot run with.
    pub fn validate(&self) -> MessengerResult<()> {
        if self.max_record_size == 0 {
            return Err(MessengerError::config("max_record_size must be positive"));
        }
        if self.read_buffer_size == 0 {
            return Err(MessengerError::config("read_buffer_size must be positive"));
        }
        if self.write_timeout.is_zero() {
            return Err(MessengerError::config("write_timeout must be positive"));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(MessengerError::config(
                "request_timeout must be positive (use None to wait forever)",
            ));
        }
        Ok(())
    }
}
