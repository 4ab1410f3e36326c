//! Request command: connect, send one request, print the reply.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use linemux_messenger::{Messenger, connect};
use linemux_protocol::Envelope;

use crate::config::CliConfig;
use crate::error::{CliError, CliResult};

/// Sends one request and prints the reply data as pretty JSON.
///
/// A streaming reply prints its first envelope only.
pub async fn run(config: &CliConfig, message_type: &str, data: Option<&str>) -> CliResult<()> {
    let payload = parse_payload(data)?;
    let reply = send(config, message_type, payload).await?;

    let rendered = serde_json::to_string_pretty(&reply)
        .map_err(|e| CliError::Usage(format!("cannot render reply: {}", e)))?;
    println!("{}", rendered);

    match Envelope::from_value(reply) {
        Ok(envelope) if !envelope.is_success() => Err(CliError::Remote(
            envelope.error.unwrap_or_else(|| "unknown error".to_string()),
        )),
        _ => Ok(()),
    }
}

/// Parses the payload argument. Absent means `null`.
pub fn parse_payload(data: Option<&str>) -> CliResult<Value> {
    match data {
        None => Ok(Value::Null),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| CliError::Usage(format!("payload is not valid JSON: {}", e))),
    }
}

/// Connects to the configured peer and returns the first reply's data.
pub async fn send(config: &CliConfig, message_type: &str, payload: Value) -> CliResult<Value> {
    let messenger_config = config.to_messenger_config()?;
    let addr = messenger_config.bind_addr;
    let messenger = Messenger::new(messenger_config);

    let connection = connect(addr, &messenger).await?;
    let reply = messenger.request(message_type, payload).await;

    messenger.detach().await;
    if tokio::time::timeout(Duration::from_secs(1), connection)
        .await
        .is_err()
    {
        debug!("Peer did not close the connection in time");
    }

    Ok(reply?)
}
