//! Serve command: listen on TCP and answer with the built-in handlers.

use tracing::{info, warn};

use linemux_messenger::{ErrorEvent, Messenger, SocketServer};

use crate::config::CliConfig;
use crate::error::CliResult;
use crate::handlers;

/// Binds the listener and serves peers until Ctrl-C.
pub async fn run(config: &CliConfig) -> CliResult<()> {
    let messenger_config = config.to_messenger_config()?;
    let server = SocketServer::bind(&messenger_config).await?;

    let messenger = Messenger::new(messenger_config);
    handlers::register_builtin(&messenger);
    messenger.on_error(|event| {
        if let ErrorEvent::Transport(e) = event {
            warn!(error = %e, "Connection failed, waiting for the next peer");
        }
    });

    info!(addr = %server.local_addr(), "Serving ping, echo and count");
    server
        .run_until_shutdown(&messenger, shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, serving until killed");
        std::future::pending::<()>().await;
    }
}
