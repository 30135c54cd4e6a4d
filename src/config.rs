//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over the built-in fixture defaults.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

/// How workers are fanned out over the shared listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One child process per worker.
    Process,
    /// One thread per worker inside a single process.
    Thread,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-pool")]
#[command(author = "echo-pool authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-process HTTP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:3000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of workers (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Worker fan-out mode
    #[arg(long, value_enum)]
    pub mode: Option<WorkerMode>,

    /// Always answer with JSON, ignoring `format=html`
    #[arg(long)]
    pub json_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Set by the supervisor on spawned worker processes
    #[arg(long, hide = true)]
    pub worker_id: Option<usize>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Worker fan-out mode
    #[serde(default = "default_mode")]
    pub mode: WorkerMode,
    /// Maximum open connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events drained per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            mode: default_mode(),
            max_connections: default_max_connections(),
            batch_size: default_batch_size(),
        }
    }
}

/// HTTP wire limits
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    /// Largest accepted request line plus header section
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Largest accepted request body
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Response rendering configuration
#[derive(Debug, Deserialize)]
pub struct RenderConfig {
    /// Honor `format=html`
    #[serde(default = "default_html")]
    pub html: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            html: default_html(),
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
    "127.0.0.1:3000".to_string()
}

fn default_workers() -> usize {
    12
}

fn default_mode() -> WorkerMode {
    WorkerMode::Process
}

fn default_max_connections() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1024
}

fn default_max_header_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_max_body_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_html() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Host part of the listen address, as echoed in absolute URLs.
    pub host: String,
    pub port: u16,
    pub addr: SocketAddr,
    pub workers: usize,
    pub mode: WorkerMode,
    pub max_connections: usize,
    pub batch_size: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub html: bool,
    pub log_level: String,
    /// Present only inside a spawned worker process.
    pub worker_id: Option<usize>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let (host, port, addr) = resolve_listen(&listen)?;

        let workers = match cli.workers.unwrap_or(toml_config.server.workers) {
            0 => num_cpus(),
            n => n,
        };

        Ok(Config {
            host,
            port,
            addr,
            workers,
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            max_connections: toml_config.server.max_connections.max(1),
            batch_size: toml_config.server.batch_size.max(1),
            max_header_size: toml_config.http.max_header_size,
            max_body_size: toml_config.http.max_body_size,
            html: !cli.json_only && toml_config.render.html,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            worker_id: cli.worker_id,
        })
    }
}

/// Split a `host:port` listen string and resolve it to a socket address.
fn resolve_listen(listen: &str) -> Result<(String, u16, SocketAddr), ConfigError> {
    let invalid = || ConfigError::InvalidListen(listen.to_string());

    let (host, port) = listen.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)?;

    Ok((host.to_string(), port, addr))
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
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
            ConfigError::InvalidListen(listen) => {
                write!(f, "Invalid listen address '{listen}', expected host:port")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
