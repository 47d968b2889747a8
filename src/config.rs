//! Configuration module for the data worker.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default wait timeout per multiplexer call, in milliseconds.
pub const WORKER_TIMEOUT: u64 = 100;
/// Default capacity hint for the multiplexer event list.
pub const WORKER_NEVENT: usize = 1024;
/// Default capacity of each handoff ring.
pub const QUEUE_CAPACITY: usize = 1024;
/// Default initial size of per-connection read/write buffers.
pub const BUF_INIT_SIZE: usize = 16 * 1024;

/// Protocol served by the worker's processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Ping,
    Echo,
}

/// Command-line arguments for the data worker
#[derive(Parser, Debug)]
#[command(name = "data-worker")]
#[command(author = "data-worker authors")]
#[command(version = "0.1.0")]
#[command(about = "Event-driven worker core with acceptor handoff", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:12321)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Protocol processor to run on the worker
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Worker wait timeout in milliseconds
    #[arg(long)]
    pub worker_timeout: Option<u64>,

    /// Maximum events returned by a single worker wait
    #[arg(long)]
    pub worker_nevent: Option<usize>,

    /// Capacity of the new/terminated connection queues
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Initial size of connection buffers in bytes
    #[arg(long)]
    pub buf_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub buf: BufConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Acceptor-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Protocol processor
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolType,
    /// Handoff ring capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            protocol: default_protocol(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Worker event loop configuration
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Wait timeout in milliseconds
    #[serde(default = "default_worker_timeout")]
    pub timeout: u64,
    /// Event list capacity
    #[serde(default = "default_worker_nevent")]
    pub nevent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout: default_worker_timeout(),
            nevent: default_worker_nevent(),
        }
    }
}

/// Connection buffer configuration
#[derive(Debug, Deserialize)]
pub struct BufConfig {
    #[serde(default = "default_buf_size")]
    pub init_size: usize,
}

impl Default for BufConfig {
    fn default() -> Self {
        Self {
            init_size: default_buf_size(),
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
    "127.0.0.1:12321".to_string()
}

fn default_protocol() -> ProtocolType {
    ProtocolType::Ping
}

fn default_queue_capacity() -> usize {
    QUEUE_CAPACITY
}

fn default_worker_timeout() -> u64 {
    WORKER_TIMEOUT
}

fn default_worker_nevent() -> usize {
    WORKER_NEVENT
}

fn default_buf_size() -> usize {
    BUF_INIT_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Options consumed by `Worker::setup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Wait timeout per multiplexer call.
    pub timeout: Duration,
    /// Capacity hint for the multiplexer event list.
    pub nevent: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(WORKER_TIMEOUT),
            nevent: WORKER_NEVENT,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub protocol: ProtocolType,
    pub queue_capacity: usize,
    pub buf_size: usize,
    pub worker: WorkerOptions,
    pub log_level: String,
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

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let timeout = cli.worker_timeout.unwrap_or(toml_config.worker.timeout);

        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            protocol: cli.protocol.unwrap_or(toml_config.server.protocol),
            queue_capacity: cli
                .queue_capacity
                .unwrap_or(toml_config.server.queue_capacity)
                .max(1),
            buf_size: cli.buf_size.unwrap_or(toml_config.buf.init_size).max(1),
            worker: WorkerOptions {
                timeout: Duration::from_millis(timeout),
                nevent: cli
                    .worker_nevent
                    .unwrap_or(toml_config.worker.nevent)
                    .max(1),
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
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
