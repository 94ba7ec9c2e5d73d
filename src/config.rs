//! Configuration for the reactor-pool server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::cache::{self, CacheSettings};
use crate::pool::{self, PoolSettings};
use crate::runtime::{self, RuntimeSettings};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "reactor-pool")]
#[command(version = "0.1.0")]
#[command(about = "A reactor-driven HTTP server on a self-scaling worker pool", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Initial number of pool workers (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Directory served for GET requests
    #[arg(short = 'd', long)]
    pub doc_root: Option<PathBuf>,

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
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection handling
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Initial number of pool workers
    pub workers: Option<usize>,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Idle time before a connection is closed
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_events: default_max_events(),
            poll_timeout_ms: default_poll_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            keepalive_ms: default_keepalive_ms(),
            max_connections: default_max_connections(),
        }
    }
}

/// Worker pool bounds and scaling
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    #[serde(default = "default_rebalance_interval_secs")]
    pub rebalance_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
            rebalance_interval_secs: default_rebalance_interval_secs(),
        }
    }
}

/// File cache
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_doc_root")]
    pub doc_root: PathBuf,
    /// Age after which an entry is revalidated
    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: u64,
    /// Age after which an entry is evicted
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            doc_root: default_doc_root(),
            freshness_ms: default_freshness_ms(),
            max_age_ms: default_max_age_ms(),
            max_entries: default_max_entries(),
            compression_level: default_compression_level(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Bearer token authentication. Disabled when no tokens are configured.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenGrant>,
    /// Paths served without a token
    #[serde(default)]
    pub public_paths: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    /// Expiry as unix seconds
    pub expires: Option<i64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "127.0.0.1:9000".to_string()
}

fn default_max_events() -> usize {
    runtime::DEFAULT_MAX_EVENTS
}

fn default_poll_timeout_ms() -> u64 {
    runtime::DEFAULT_POLL_TIMEOUT.as_millis() as u64
}

fn default_write_timeout_ms() -> u64 {
    runtime::DEFAULT_WRITE_TIMEOUT.as_millis() as u64
}

fn default_keepalive_ms() -> u64 {
    runtime::DEFAULT_KEEPALIVE_MS
}

fn default_max_connections() -> usize {
    runtime::DEFAULT_MAX_CONNECTIONS
}

fn default_min_workers() -> usize {
    pool::DEFAULT_MIN_WORKERS
}

fn default_max_workers() -> usize {
    pool::DEFAULT_MAX_WORKERS
}

fn default_low_watermark() -> f64 {
    pool::DEFAULT_LOW_WATERMARK
}

fn default_high_watermark() -> f64 {
    pool::DEFAULT_HIGH_WATERMARK
}

fn default_rebalance_interval_secs() -> u64 {
    pool::DEFAULT_REBALANCE_INTERVAL.as_secs()
}

fn default_doc_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_freshness_ms() -> u64 {
    cache::DEFAULT_FRESHNESS_MS
}

fn default_max_age_ms() -> u64 {
    cache::DEFAULT_MAX_AGE_MS
}

fn default_max_entries() -> usize {
    cache::DEFAULT_MAX_ENTRIES
}

fn default_compression_level() -> u32 {
    cache::DEFAULT_COMPRESSION_LEVEL
}

fn default_sweep_interval_ms() -> u64 {
    runtime::DEFAULT_SWEEP_INTERVAL_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Number of available CPU cores
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub runtime: RuntimeSettings,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
    pub doc_root: PathBuf,
    pub auth: AuthConfig,
    pub log_level: String,
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

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over the TOML config and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            pool,
            cache,
            auth,
            logging,
        } = toml_config;

        let listen_str = cli.listen.unwrap_or(server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{listen_str}'")))?;

        let initial = cli
            .workers
            .or(server.workers)
            .unwrap_or_else(|| num_cpus().clamp(pool.min_workers, pool.max_workers.max(pool.min_workers)));

        let config = Config {
            runtime: RuntimeSettings {
                listen,
                max_events: server.max_events,
                poll_timeout: Duration::from_millis(server.poll_timeout_ms),
                write_timeout: Duration::from_millis(server.write_timeout_ms),
                keepalive_ms: server.keepalive_ms,
                max_connections: server.max_connections,
                sweep_interval_ms: cache.sweep_interval_ms,
            },
            pool: PoolSettings {
                initial,
                min: pool.min_workers,
                max: pool.max_workers,
                low_watermark: pool.low_watermark,
                high_watermark: pool.high_watermark,
                rebalance_interval: Duration::from_secs(pool.rebalance_interval_secs),
            },
            cache: CacheSettings {
                freshness_ms: cache.freshness_ms,
                max_age_ms: cache.max_age_ms,
                max_entries: cache.max_entries,
                compression_level: cache.compression_level,
            },
            doc_root: cli.doc_root.unwrap_or(cache.doc_root),
            auth,
            log_level: cli.log_level.unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.min == 0 {
            return Err(ConfigError::Invalid("min_workers must be at least 1".into()));
        }
        if pool.max == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if pool.min > pool.max {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                pool.min, pool.max
            )));
        }
        if pool.initial > pool.max {
            return Err(ConfigError::Invalid(format!(
                "workers ({}) exceeds max_workers ({})",
                pool.initial, pool.max
            )));
        }
        let in_unit = |w: f64| (0.0..=1.0).contains(&w);
        if !in_unit(pool.low_watermark)
            || !in_unit(pool.high_watermark)
            || pool.low_watermark >= pool.high_watermark
        {
            return Err(ConfigError::Invalid(format!(
                "watermarks must satisfy 0 <= low < high <= 1 (got {} and {})",
                pool.low_watermark, pool.high_watermark
            )));
        }
        if pool.rebalance_interval.is_zero() {
            return Err(ConfigError::Invalid("rebalance_interval_secs must be positive".into()));
        }

        let rt = &self.runtime;
        if rt.max_events == 0 || rt.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_events and max_connections must be positive".into(),
            ));
        }
        if rt.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid("max_entries must be positive".into()));
        }
        if self.cache.compression_level > 9 {
            return Err(ConfigError::Invalid(format!(
                "compression_level must be 0-9 (got {})",
                self.cache.compression_level
            )));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
