//! linemux CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use linemux_cli::cli::{Cli, Command, ConfigAction};
use linemux_cli::commands;
use linemux_cli::config::CliConfig;
use linemux_cli::error::{CliError, CliResult};
use linemux_core::{TracingConfig, TracingOutputFormat, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let mut config = match cli.config {
        Some(ref path) => CliConfig::load_from(path)?,
        None => CliConfig::load()?,
    };

    setup_tracing(&cli, &config)?;

    match cli.command {
        Command::Serve { endpoint } => {
            config.apply_endpoint(&endpoint);
            commands::serve::run(&config).await
        }
        Command::Request {
            message_type,
            data,
            endpoint,
            timeout,
        } => {
            config.apply_endpoint(&endpoint);
            if let Some(secs) = timeout {
                config.request.timeout = secs;
            }
            commands::request::run(&config, &message_type, data.as_deref()).await
        }
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}

fn setup_tracing(cli: &Cli, config: &CliConfig) -> CliResult<()> {
    let mut tracing_config = if cli.debug || config.debug {
        TracingConfig::debug()
    } else {
        TracingConfig::default().with_level(Level::WARN)
    };

    // `serve` is a long-running process; keep its connect/disconnect lines.
    if matches!(cli.command, Command::Serve { .. }) && !(cli.debug || config.debug) {
        tracing_config = tracing_config.with_level(Level::INFO);
    }

    if let Some(format) = cli.log_format.as_deref().or(config.log_format.as_deref()) {
        let format = format.parse::<TracingOutputFormat>().map_err(CliError::Usage)?;
        tracing_config = tracing_config.with_format(format);
    }

    init_tracing(tracing_config)?;
    Ok(())
}
