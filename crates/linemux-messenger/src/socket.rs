//! TCP transport for the messenger.
//!
//! The server side accepts one peer at a time and hands it to the messenger
//! until it disconnects, then goes back to accepting. The client side
//! connects once and serves the stream from a background task.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::MessengerConfig;
use crate::error::MessengerResult;
use crate::messenger::Messenger;

/// TCP listener feeding connections to a [`Messenger`].
pub struct SocketServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl SocketServer {
    /// Binds to `config.bind_addr`.
    pub async fn bind(config: &MessengerConfig) -> MessengerResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Socket server listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the bound address. Useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts a single connection.
    pub async fn accept(&self) -> MessengerResult<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    /// Serves peers one after another, forever.
    ///
    /// Only one peer is served at a time. A peer connecting meanwhile
    /// completes its TCP handshake and waits in the listen backlog; nothing it
    /// sends is read until the active peer disconnects, so its requests may
    /// time out first. A peer that fails is logged and the next one is
    /// accepted.
    pub async fn run(&self, messenger: &Messenger) -> MessengerResult<()> {
        loop {
            let (stream, peer) = match self.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            info!(peer = %peer, "Connected");
            match messenger.serve_connection(stream).await {
                Ok(()) => info!(peer = %peer, "Disconnected"),
                Err(e) => info!(peer = %peer, error = %e, "Disconnected"),
            }
        }
    }

    /// Runs [`SocketServer::run`] until `shutdown` completes.
    pub async fn run_until_shutdown<S>(
        &self,
        messenger: &Messenger,
        shutdown: S,
    ) -> MessengerResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(messenger) => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                messenger.detach().await;
                Ok(())
            }
        }
    }
}

/// Connects to `addr` and serves the connection with `messenger` in the
/// background.
///
/// Returns once the connection is attached, so sends can start right away.
/// The task ends when the peer closes the connection.
pub async fn connect<A>(
    addr: A,
    messenger: &Messenger,
) -> MessengerResult<JoinHandle<MessengerResult<()>>>
where
    A: ToSocketAddrs,
{
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    info!(peer = %peer, "Connected");

    let (reader, writer) = stream.into_split();
    messenger.attach(writer).await;

    let messenger = messenger.clone();
    Ok(tokio::spawn(async move {
        let result = messenger.read_loop(reader).await;
        messenger.detach().await;
        info!(peer = %peer, "Disconnected");
        result
    }))
}
