//! Error types shared across the watchdog library

use std::time::Duration;
use thiserror::Error;

/// Failure talking to the container runtime.
///
/// These are transient from the poll loop's point of view: the affected
/// container is skipped for the current cycle and retried on the next one.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    #[error("runtime request timed out after {0:?}")]
    Timeout(Duration),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("runtime API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode runtime response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RuntimeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RuntimeError::Decode(e.to_string())
        } else {
            RuntimeError::Unreachable(e.to_string())
        }
    }
}

/// Failure reading from or writing to the event log
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to open event store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("event store query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Invalid configuration, fatal at startup
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("poll interval must be greater than zero")]
    InvalidInterval,

    #[error("fetch timeout must be greater than zero")]
    InvalidFetchTimeout,

    #[error("anomaly threshold must be a finite, non-negative number (got {0})")]
    InvalidThreshold(f64),

    #[error("history window must hold at least 2 samples (got {0})")]
    InvalidRetention(usize),

    #[error("report buffer size must be greater than zero")]
    InvalidBufferSize,

    #[error("a container runtime is required")]
    MissingRuntime,
}
