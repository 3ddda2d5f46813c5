//! Configuration module for cache-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which upstream responses are written into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheWritePolicy {
    /// Store only responses whose path starts with the cache prefix.
    #[default]
    Prefix,
    /// Store every forwarded response under its path, prefixed or not.
    Always,
}

/// Command-line arguments for the proxy
#[derive(Parser, Debug)]
#[command(name = "cache-relay")]
#[command(version = "0.1.0")]
#[command(about = "A forwarding HTTP proxy with a path-keyed response cache", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to bind the loopback listener to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address of the upstream server (host:port)
    #[arg(short, long, alias = "proxy")]
    pub upstream: Option<String>,

    /// Request path prefix eligible for caching
    #[arg(long = "cache")]
    pub cache_prefix: Option<String>,

    /// Which forwarded responses get stored in the cache
    #[arg(long, value_enum)]
    pub cache_write: Option<CacheWritePolicy>,

    /// Socket read timeout in milliseconds; a timed-out read ends a pending message
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

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
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Loopback port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Socket read timeout in milliseconds
    pub read_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_timeout_ms: None,
        }
    }
}

/// Upstream connection configuration
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream")]
    pub address: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: default_upstream(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Deserialize, Default)]
pub struct CacheConfig {
    /// Path prefix eligible for caching (empty matches every path)
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub write: CacheWritePolicy,
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

fn default_port() -> u16 {
    8000
}

fn default_upstream() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub upstream: String,
    pub cache_prefix: String,
    pub cache_write: CacheWritePolicy,
    pub read_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                port: None,
                upstream: None,
                cache_prefix: None,
                cache_write: None,
                read_timeout_ms: None,
                log_level: None,
            },
            TomlConfig::default(),
        )
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            port: cli.port.unwrap_or(toml_config.server.port),
            upstream: cli.upstream.unwrap_or(toml_config.upstream.address),
            cache_prefix: cli.cache_prefix.unwrap_or(toml_config.cache.prefix),
            cache_write: cli.cache_write.unwrap_or(toml_config.cache.write),
            read_timeout: cli
                .read_timeout_ms
                .or(toml_config.server.read_timeout_ms)
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values that can never produce a working proxy.
    fn validate(&self) -> Result<(), ConfigError> {
        match self.upstream.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
            _ => Err(ConfigError::InvalidUpstream(self.upstream.clone())),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid upstream address '{0}', expected host:port")]
    InvalidUpstream(String),
}
