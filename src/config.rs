//! Configuration for the echo server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Log severity selectable on the command line.
///
/// `fatal` is accepted for compatibility with the usual daemon levels and
/// maps to the `error` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Directive understood by the tracing env filter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

/// Command-line arguments for the echo server.
#[derive(Parser, Debug)]
#[command(name = "echod")]
#[command(version)]
#[command(about = "Multi-reactor TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Listen port
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Listen address (0.0.0.0 binds every interface)
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Number of I/O worker threads (0 = single-reactor mode, default =
    /// hardware concurrency)
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Log level
    #[arg(short = 'l', long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Log file path (default: console only)
    #[arg(short = 'f', long)]
    pub log_file: Option<PathBuf>,

    /// Compute threads for the echo pool (0 = echo inline on the I/O
    /// thread)
    #[arg(long)]
    pub compute_threads: Option<usize>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_address")]
    pub address: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of I/O worker threads
    pub threads: Option<usize>,
    /// Compute threads for the echo pool
    #[serde(default)]
    pub compute_threads: usize,
    /// Bounded capacity of the compute task queue
    #[serde(default = "default_task_queue_size")]
    pub task_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            threads: None,
            compute_threads: 0,
            task_queue_size: default_task_queue_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default)]
    pub level: LogLevel,
    /// Log file path
    pub file: Option<PathBuf>,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_task_queue_size() -> usize {
    1024
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub threads: usize,
    pub compute_threads: usize,
    pub task_queue_size: usize,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Merge CLI args with the optional TOML file; CLI takes precedence.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let port = cli.port.unwrap_or(toml_config.server.port);
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        Ok(Config {
            address: cli.address.unwrap_or(toml_config.server.address),
            port,
            threads: cli
                .threads
                .or(toml_config.server.threads)
                .unwrap_or_else(default_thread_count),
            compute_threads: cli
                .compute_threads
                .unwrap_or(toml_config.server.compute_threads),
            task_queue_size: toml_config.server.task_queue_size,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        })
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort,
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
            ConfigError::InvalidPort => {
                write!(f, "Invalid port: expected 1-65535")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let cli = CliArgs::parse_from(["echod"]);
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(config.threads >= 1);
        assert_eq!(config.compute_threads, 0);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_cli_arguments() {
        let cli = CliArgs::parse_from([
            "echod",
            "-p",
            "9999",
            "-a",
            "127.0.0.1",
            "-t",
            "4",
            "-l",
            "debug",
            "--compute-threads",
            "2",
        ]);
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.threads, 4);
        assert_eq!(config.compute_threads, 2);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_port_zero_rejected_on_cli() {
        assert!(CliArgs::try_parse_from(["echod", "-p", "0"]).is_err());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            address = "127.0.0.1"
            port = 9090
            threads = 8
            compute_threads = 3
            task_queue_size = 64

            [logging]
            level = "warn"
            file = "/tmp/echod.log"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.threads, Some(8));
        assert_eq!(config.server.compute_threads, 3);
        assert_eq!(config.server.task_queue_size, 64);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/echod.log")));
    }

    #[test]
    fn test_fatal_maps_to_error_filter() {
        assert_eq!(LogLevel::Fatal.as_filter(), "error");
        assert_eq!(LogLevel::Error.as_filter(), "error");
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }
}
