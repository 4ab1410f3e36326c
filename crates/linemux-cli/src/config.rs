//! CLI configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/linemux/config.toml` by default. Command-line flags override
//! the file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use linemux_messenger::{DEFAULT_PORT, MessengerConfig};
use linemux_protocol::DEFAULT_MAX_RECORD_SIZE;

use crate::cli::EndpointArgs;
use crate::error::{CliError, CliResult};

/// Configuration for the linemux CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Debug mode.
    pub debug: bool,

    /// Log format: pretty, compact or json.
    pub log_format: Option<String>,

    /// Listener/connection settings.
    pub server: ServerSettings,

    /// Request settings.
    pub request: RequestSettings,
}

/// Where to listen or connect, and stream limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host address. `localhost` is accepted as an alias for 127.0.0.1.
    pub host: String,

    /// TCP port.
    pub port: u16,

    /// Cap on a partial record, in bytes.
    pub max_record_size: usize,

    /// Seconds allowed for writing one record.
    pub write_timeout: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port: DEFAULT_PORT,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            write_timeout: 30,
        }
    }
}

/// Request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Seconds to wait for a reply. 0 waits forever.
    pub timeout: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self { timeout: 30 }
    }
}

impl CliConfig {
    /// Loads configuration from the default path.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| CliError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("linemux")
    }

    /// Applies `--host`/`--port` overrides.
    pub fn apply_endpoint(&mut self, endpoint: &EndpointArgs) {
        if let Some(ref host) = endpoint.host {
            self.server.host = host.clone();
        }
        if let Some(port) = endpoint.port {
            self.server.port = port;
        }
    }

    /// Resolves the configured host and port.
    pub fn socket_addr(&self) -> CliResult<SocketAddr> {
        let ip = if self.server.host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.server.host.parse::<IpAddr>().map_err(|e| {
                CliError::Config(format!("invalid host {:?}: {}", self.server.host, e))
            })?
        };
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Builds the messenger configuration.
    pub fn to_messenger_config(&self) -> CliResult<MessengerConfig> {
        let request_timeout = match self.request.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let config = MessengerConfig::new(self.socket_addr()?)
            .with_max_record_size(self.server.max_record_size)
            .with_write_timeout(Duration::from_secs(self.server.write_timeout))
            .with_request_timeout(request_timeout);
        config
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))?;
        Ok(config)
    }
}
