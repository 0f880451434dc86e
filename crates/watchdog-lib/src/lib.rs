//! Core library for the container watchdog
//!
//! This crate provides the core functionality for:
//! - Normalizing cumulative container counters into usage metrics
//! - Rolling per-container baselines and anomaly detection
//! - The periodic poll loop over a container runtime
//! - A durable, append-only log of container lifecycle events
//! - Health checks and observability

pub mod anomaly;
pub mod error;
pub mod events;
pub mod health;
pub mod models;
pub mod normalizer;
pub mod observability;
pub mod poller;
pub mod runtime;

pub use anomaly::{
    AnomalyDetector, AnomalyFinding, Baseline, HistoryRetention, MetricKind, RollingBaseline,
};
pub use error::{ConfigError, PersistenceError, RuntimeError};
pub use events::{EventFilter, EventRecorder, EventStore, RecorderConfig};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, WatchdogMetrics};
pub use poller::{PollConfig, PollLoop, PollLoopBuilder, PollState};
pub use runtime::{ContainerRuntime, DockerRuntime};
