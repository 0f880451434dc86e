//! Threshold anomaly detection
//!
//! Flags CPU or memory readings that exceed the container's baseline mean by
//! more than `k` standard deviations.

use serde::Serialize;

use super::Baseline;
use crate::models::MetricsRecord;

/// Default number of standard deviations above the mean
pub const DEFAULT_THRESHOLD: f64 = 2.0;

/// Which metric a finding refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Cpu => write!(f, "CPU"),
            MetricKind::Memory => write!(f, "MEMORY"),
        }
    }
}

/// Severity levels derived from how far a reading sits above its mean
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A single anomalous reading for one container and metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyFinding {
    pub entity_name: String,
    pub metric_kind: MetricKind,
    pub observed_value: f64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
}

impl AnomalyFinding {
    /// Number of standard deviations above the mean, `None` for a flat baseline
    pub fn z_score(&self) -> Option<f64> {
        if self.baseline_stddev < f64::EPSILON {
            return None;
        }
        Some((self.observed_value - self.baseline_mean) / self.baseline_stddev)
    }

    /// Get the percentage above the baseline mean
    pub fn percentage_above_mean(&self) -> f64 {
        if self.baseline_mean.abs() < f64::EPSILON {
            return 0.0;
        }
        ((self.observed_value - self.baseline_mean) / self.baseline_mean) * 100.0
    }

    /// Get severity level based on z-score
    pub fn severity(&self) -> Severity {
        match self.z_score() {
            Some(z) if z >= 5.0 => Severity::Critical,
            Some(z) if z >= 4.0 => Severity::High,
            _ => Severity::Warning,
        }
    }
}

/// Compares fresh readings against a container's baseline
#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    /// Number of standard deviations above the mean that counts as anomalous
    pub threshold: f64,
}

impl AnomalyDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Detect anomalies in `metrics` against the baseline computed before it.
    ///
    /// Returns an empty vector when there is no baseline yet or nothing
    /// exceeds `mean + threshold * stddev`.
    pub fn detect(
        &self,
        entity: &str,
        metrics: &MetricsRecord,
        baseline: Option<&Baseline>,
    ) -> Vec<AnomalyFinding> {
        let Some(baseline) = baseline else {
            return Vec::new();
        };

        let checks = [
            (
                MetricKind::Cpu,
                metrics.cpu_percent,
                baseline.cpu_mean,
                baseline.cpu_stddev,
            ),
            (
                MetricKind::Memory,
                metrics.mem_mb,
                baseline.mem_mean,
                baseline.mem_stddev,
            ),
        ];

        checks
            .into_iter()
            .filter(|(_, observed, mean, stddev)| *observed > mean + self.threshold * stddev)
            .map(|(metric_kind, observed_value, baseline_mean, baseline_stddev)| {
                AnomalyFinding {
                    entity_name: entity.to_string(),
                    metric_kind,
                    observed_value,
                    baseline_mean,
                    baseline_stddev,
                }
            })
            .collect()
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}
