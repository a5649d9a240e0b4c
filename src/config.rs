//! Configuration module for stream-tee.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How the engine moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Kernel pipes with splice and tee; no user-space copy.
    #[value(alias = "splicetee", alias = "splice")]
    #[serde(alias = "splicetee", alias = "splice")]
    SpliceTee,
    /// One user-space block with recv and send.
    #[value(alias = "recvsend")]
    #[serde(alias = "recvsend")]
    RecvSend,
}

/// Socket family for the local connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Unix,
}

/// Command-line arguments for the duplicator
#[derive(Parser, Debug)]
#[command(name = "stream-tee")]
#[command(author = "stream-tee authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Echoes a stream back to its sender and mirrors it to an observer over io_uring",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Relay strategy
    #[arg(short, long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Socket family for the simulated connections
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Block size in memory pages
    #[arg(short, long)]
    pub pages: Option<usize>,

    /// io_uring submission queue entries (power of two)
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Seconds between report lines
    #[arg(long)]
    pub report_interval: Option<f64>,

    /// Seconds of history behind the throughput estimate
    #[arg(long)]
    pub rate_window: Option<f64>,

    /// File receiving a copy of every report line
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Bytes the simulated client sends before half-closing (0 = unlimited)
    #[arg(long)]
    pub source_bytes: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine configuration
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
    /// Block size in pages
    #[serde(default = "default_pages")]
    pub pages: usize,
    /// Submission queue entries
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            pages: default_pages(),
            ring_size: default_ring_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport")]
    pub kind: TransportKind,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport(),
        }
    }
}

/// Reporting configuration
#[derive(Debug, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: f64,
    /// Empty string disables the file copy
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            rate_window_secs: default_rate_window_secs(),
            log_file: default_log_file(),
        }
    }
}

/// Traffic simulator configuration
#[derive(Debug, Deserialize, Default)]
pub struct SimulatorConfig {
    /// Bytes sent before half-closing; 0 sends forever
    #[serde(default)]
    pub source_bytes: u64,
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

fn default_strategy() -> Strategy {
    Strategy::SpliceTee
}

fn default_pages() -> usize {
    16 // 64 KiB with 4 KiB pages, the default pipe size
}

fn default_ring_size() -> u32 {
    8
}

fn default_transport() -> TransportKind {
    TransportKind::Tcp
}

fn default_interval_secs() -> f64 {
    1.0
}

fn default_rate_window_secs() -> f64 {
    1.0
}

fn default_log_file() -> PathBuf {
    PathBuf::from("log")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub strategy: Strategy,
    pub transport: TransportKind,
    pub pages: usize,
    pub ring_size: u32,
    pub report_interval: Duration,
    pub rate_window: Duration,
    pub log_file: Option<PathBuf>,
    /// `None` when the source never stops
    pub source_bytes: Option<u64>,
    pub log_level: String,
    page_size: usize,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config, page_size()?)
    }

    /// Merge parsed sources and validate the result.
    pub fn merge(cli: CliArgs, toml: TomlConfig, page_size: usize) -> Result<Self, ConfigError> {
        let log_file = cli.log_file.unwrap_or(toml.report.log_file);
        let source_bytes = cli.source_bytes.unwrap_or(toml.simulator.source_bytes);

        let config = Config {
            strategy: cli.strategy.unwrap_or(toml.engine.strategy),
            transport: cli.transport.unwrap_or(toml.transport.kind),
            pages: cli.pages.unwrap_or(toml.engine.pages),
            ring_size: cli.ring_size.unwrap_or(toml.engine.ring_size),
            report_interval: seconds(
                "report interval",
                cli.report_interval.unwrap_or(toml.report.interval_secs),
            )?,
            rate_window: seconds(
                "rate window",
                cli.rate_window.unwrap_or(toml.report.rate_window_secs),
            )?,
            log_file: (!log_file.as_os_str().is_empty()).then_some(log_file),
            source_bytes: (source_bytes > 0).then_some(source_bytes),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml.logging.level
            },
            page_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Engine block size in bytes.
    pub fn block_size(&self) -> usize {
        self.pages.saturating_mul(self.page_size)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pages == 0 {
            return Err(ConfigError::Invalid("pages must be at least 1".into()));
        }
        if self.ring_size < 2 || !self.ring_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "ring size {} must be a power of two of at least 2",
                self.ring_size
            )));
        }
        if self.block_size() > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "block of {} pages exceeds {} bytes",
                self.pages,
                u32::MAX
            )));
        }
        Ok(())
    }
}

fn seconds(what: &str, secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::Invalid(format!(
            "{what} must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ConfigError::Invalid(format!("{what} of {secs} seconds: {e}")))
}

fn page_size() -> Result<usize, ConfigError> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size)
        .ok()
        .filter(|&s| s > 0)
        .ok_or_else(|| ConfigError::Invalid("cannot determine page size".into()))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
