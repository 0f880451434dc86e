//! Watchdog configuration

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use watchdog_lib::{
    anomaly::HistoryRetention, error::ConfigError, events::RecorderConfig, poller::PollConfig,
};

/// Environment variable naming an alternative config file
const CONFIG_PATH_ENV: &str = "WATCHDOG_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "watchdog.toml";

const MAX_REPORT_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Watchdog configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Name of the host, attached to every structured log record
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/events
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Docker Engine API endpoint
    #[serde(default = "default_runtime_endpoint")]
    pub runtime_endpoint: String,

    /// SQLite file holding the lifecycle event log
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Timeout for a single runtime request in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Standard deviations above the mean that count as anomalous
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,

    /// Samples kept per container baseline; 0 keeps everything
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Capacity of the poll report channel
    #[serde(default = "default_report_buffer")]
    pub report_buffer: usize,

    /// Lifecycle event types to persist; empty persists all
    #[serde(default)]
    pub event_types: Vec<String>,

    /// Lifecycle events held in memory while the store is failing
    #[serde(default = "default_max_pending_events")]
    pub max_pending_events: usize,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_runtime_endpoint() -> String {
    "http://localhost:2375".to_string()
}

fn default_database_path() -> String {
    "watchdog-events.db".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_anomaly_threshold() -> f64 {
    2.0
}

fn default_history_window() -> usize {
    1440
}

fn default_report_buffer() -> usize {
    1000
}

fn default_max_pending_events() -> usize {
    1000
}

impl WatchdogConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let builder = config::Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("WATCHDOG")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("event_types"),
            );

        Self::from_builder(builder)
    }

    /// Deserialize and validate a prepared set of sources
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Self = builder
            .build()
            .context("Failed to read watchdog configuration")?
            .try_deserialize()
            .context("Failed to parse watchdog configuration")?;

        config
            .poll_config()
            .context("Invalid watchdog configuration")?;

        Ok(config)
    }

    /// Poll loop settings, validated
    pub fn poll_config(&self) -> Result<PollConfig, ConfigError> {
        let retention = match self.history_window {
            0 => HistoryRetention::Unbounded,
            size => HistoryRetention::Window(size),
        };

        let config = PollConfig {
            interval: Duration::from_secs(self.poll_interval_secs),
            fetch_timeout: self.fetch_timeout(),
            anomaly_threshold: self.anomaly_threshold,
            retention,
            buffer_size: self.report_buffer,
        };
        config.validate()?;

        Ok(config)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// How long a container's last report stays visible on `/containers`
    /// without a newer one: three full cycles, capped at a week.
    pub fn report_max_age(&self) -> chrono::Duration {
        let cycle = Duration::from_secs(self.poll_interval_secs)
            .saturating_add(self.fetch_timeout());
        let max_age = cycle.saturating_mul(3).min(MAX_REPORT_AGE);
        chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(1))
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            event_types: self
                .event_types
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            max_pending: self.max_pending_events,
            ..RecorderConfig::default()
        }
    }
}
