//! Configuration module for the line-reverser server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the line-reverser server
#[derive(Parser, Debug, Default)]
#[command(name = "line-reverser")]
#[command(author = "line-reverser authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded TCP server that reverses every line", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:7777)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of readiness events fetched per wait
    #[arg(long)]
    pub events_capacity: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Per-connection read buffer size in bytes
    #[arg(long = "read-buffer")]
    pub read_buffer_size: Option<usize>,

    /// Per-connection write buffer size in bytes
    #[arg(long = "write-buffer")]
    pub write_buffer_size: Option<usize>,

    /// Longest accepted line in bytes, terminator included (0 = unbounded)
    #[arg(long = "max-line")]
    pub max_line_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events fetched per wait
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Idle timeout in seconds, 0 disables it
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
            idle_timeout: 0,
        }
    }
}

/// Per-connection buffer configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:7777".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_events_capacity() -> usize {
    1024
}

// Small on purpose: partial fills and drains happen on almost every line.
fn default_read_buffer_size() -> usize {
    4
}

fn default_write_buffer_size() -> usize {
    5
}

fn default_max_line_length() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub idle_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// `None` means lines may grow without bound.
    pub max_line_length: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_connections: toml_config.server.max_connections,
            events_capacity: toml_config.server.events_capacity,
            idle_timeout: None,
            read_buffer_size: toml_config.connection.read_buffer_size,
            write_buffer_size: toml_config.connection.write_buffer_size,
            max_line_length: Some(toml_config.connection.max_line_length),
            log_level: toml_config.logging.level,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listen address '{listen}'")))?;

        let idle_secs = cli.idle_timeout.unwrap_or(toml_config.server.idle_timeout);
        let max_line = cli
            .max_line_length
            .unwrap_or(toml_config.connection.max_line_length);

        let config = Config {
            listen,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            events_capacity: cli
                .events_capacity
                .unwrap_or(toml_config.server.events_capacity),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.connection.read_buffer_size),
            write_buffer_size: cli
                .write_buffer_size
                .unwrap_or(toml_config.connection.write_buffer_size),
            max_line_length: (max_line > 0).then_some(max_line),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.read_buffer_size, "read_buffer_size"),
            (self.write_buffer_size, "write_buffer_size"),
            (self.max_connections, "max_connections"),
            (self.events_capacity, "events_capacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
