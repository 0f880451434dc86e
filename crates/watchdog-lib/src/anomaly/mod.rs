//! Anomaly detection for container resource usage
//!
//! This module provides:
//! - Rolling per-container baselines (mean and standard deviation)
//! - Threshold detection of CPU and memory readings above the baseline

mod baseline;
mod detector;

pub use baseline::{Baseline, HistoryRetention, RollingBaseline, DEFAULT_HISTORY_WINDOW};
pub use detector::{AnomalyDetector, AnomalyFinding, MetricKind, Severity, DEFAULT_THRESHOLD};
