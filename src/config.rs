//! Configuration.
//!
//! [`ServerConfig`] holds the tunables a [`Server`](crate::Server) reads; it
//! is fixed once the server is constructed. The binary layers command-line
//! arguments over an optional TOML file to build a [`Config`]. CLI arguments
//! take precedence over config file values.

use crate::pipeline::KeepAlivePolicy;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Server tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen backlog.
    pub backlog: u32,
    /// Seconds an idle connection is kept open. 0 disables keep-alive.
    pub keep_alive_timeout: u64,
    /// Exchanges allowed on one connection. 0 means unlimited.
    pub keepalive_requests: usize,
    /// Set TCP_NODELAY on the listener and accepted sockets.
    pub no_delay: bool,
    /// Connections held open by this process.
    pub max_connections: usize,
    /// Socket read size, and the unflushed output at which a connection stops
    /// reading requests until the peer catches up.
    pub buffer_size: usize,
    /// Readiness events handled per poll.
    pub batch_size: usize,
    /// Largest accepted request head.
    pub max_head_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            keep_alive_timeout: default_keep_alive_timeout(),
            keepalive_requests: default_keepalive_requests(),
            no_delay: false,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            max_head_size: default_max_head_size(),
        }
    }
}

impl ServerConfig {
    pub fn keep_alive_enabled(&self) -> bool {
        self.keep_alive_timeout > 0
    }

    pub fn keep_alive_duration(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }

    pub(crate) fn keep_alive_policy(&self) -> KeepAlivePolicy {
        KeepAlivePolicy {
            timeout_secs: self.keep_alive_timeout,
            max_requests: self.keepalive_requests,
        }
    }
}

/// Command-line arguments for the demo server
#[derive(Parser, Debug)]
#[command(name = "evloop-http")]
#[command(version)]
#[command(about = "An event-loop HTTP/1.1 server with multi-process connection distribution", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Keep-alive timeout in seconds (0 disables keep-alive)
    #[arg(long)]
    pub keep_alive_timeout: Option<u64>,

    /// Maximum requests per connection (0 = unlimited)
    #[arg(long)]
    pub keepalive_requests: Option<usize>,

    /// Enable TCP_NODELAY
    #[arg(long)]
    pub no_delay: bool,

    /// Number of worker processes (0 = serve in this process)
    #[arg(short = 'w', long)]
    pub cluster_workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Descriptor of the channel to the master (set when spawned as a worker)
    #[arg(long, hide = true)]
    pub worker_fd: Option<i32>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener and connection limits
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
        }
    }
}

/// Per-connection HTTP behaviour
#[derive(Debug, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: u64,
    #[serde(default = "default_keepalive_requests")]
    pub keepalive_requests: usize,
    #[serde(default)]
    pub no_delay: bool,
    #[serde(default = "default_max_head_size")]
    pub max_head_size: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            keep_alive_timeout: default_keep_alive_timeout(),
            keepalive_requests: default_keepalive_requests(),
            no_delay: false,
            max_head_size: default_max_head_size(),
        }
    }
}

/// Multi-process settings
#[derive(Debug, Deserialize, Default)]
pub struct ClusterSection {
    #[serde(default)]
    pub workers: usize,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_keep_alive_timeout() -> u64 {
    15
}

fn default_keepalive_requests() -> usize {
    100
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_batch_size() -> usize {
    1024
}

fn default_max_head_size() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub server: ServerConfig,
    pub cluster_workers: usize,
    pub worker_fd: Option<i32>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they name, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        let server = ServerConfig {
            backlog: cli.backlog.unwrap_or(file.server.backlog),
            keep_alive_timeout: cli
                .keep_alive_timeout
                .unwrap_or(file.http.keep_alive_timeout),
            keepalive_requests: cli
                .keepalive_requests
                .unwrap_or(file.http.keepalive_requests),
            no_delay: cli.no_delay || file.http.no_delay,
            max_connections: file.server.max_connections,
            buffer_size: file.server.buffer_size,
            batch_size: file.server.batch_size,
            max_head_size: file.http.max_head_size,
        };

        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            server,
            cluster_workers: cli.cluster_workers.unwrap_or(file.cluster.workers),
            worker_fd: cli.worker_fd,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
