//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// linemux - JSON messages over a CRLF-delimited TCP stream
#[derive(Debug, Parser)]
#[command(name = "linemux")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "LINEMUX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Log format: pretty, compact or json
    #[arg(long, env = "LINEMUX_LOG_FORMAT")]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Listen for a peer and answer with the built-in handlers
    Serve {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Connect, send one request and print the reply
    Request {
        /// Message type to send
        message_type: String,

        /// JSON payload (defaults to null)
        data: Option<String>,

        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Seconds to wait for the reply (0 waits forever)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Address overrides shared by `serve` and `request`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct EndpointArgs {
    /// Host to bind or connect to
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port
    #[arg(long, short)]
    pub port: Option<u16>,
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Show configuration file path
    Path,
}
