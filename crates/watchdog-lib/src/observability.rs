//! Observability infrastructure for the watchdog
//!
//! Provides:
//! - Prometheus metrics (poll latency, monitored containers, fetch errors,
//!   anomalies, recorded lifecycle events)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyFinding, Severity};
use crate::models::{EntityReport, LifecycleEvent};

/// Histogram buckets for poll cycle latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<WatchdogMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct WatchdogMetricsInner {
    poll_cycle_seconds: Histogram,
    containers_monitored: IntGauge,
    fetch_errors: IntCounter,
    anomalies_detected: IntCounterVec,
    events_recorded: IntCounter,
    persistence_errors: IntCounter,
    pending_events: IntGauge,
}

impl WatchdogMetricsInner {
    fn new() -> Self {
        Self {
            poll_cycle_seconds: register_histogram!(
                "container_watchdog_poll_cycle_seconds",
                "Time spent fetching, normalizing and analyzing one poll cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_cycle_seconds"),

            containers_monitored: register_int_gauge!(
                "container_watchdog_containers_monitored",
                "Number of containers seen in the last poll cycle"
            )
            .expect("Failed to register containers_monitored"),

            fetch_errors: register_int_counter!(
                "container_watchdog_fetch_errors_total",
                "Total number of failed runtime list or snapshot requests"
            )
            .expect("Failed to register fetch_errors"),

            anomalies_detected: register_int_counter_vec!(
                "container_watchdog_anomalies_detected_total",
                "Total number of anomalies detected",
                &["metric"]
            )
            .expect("Failed to register anomalies_detected"),

            events_recorded: register_int_counter!(
                "container_watchdog_events_recorded_total",
                "Total number of lifecycle events persisted"
            )
            .expect("Failed to register events_recorded"),

            persistence_errors: register_int_counter!(
                "container_watchdog_persistence_errors_total",
                "Total number of failed event log writes"
            )
            .expect("Failed to register persistence_errors"),

            pending_events: register_int_gauge!(
                "container_watchdog_pending_events",
                "Lifecycle events waiting for a retried write"
            )
            .expect("Failed to register pending_events"),
        }
    }
}

/// Watchdog metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct WatchdogMetrics {
    _private: (),
}

impl Default for WatchdogMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchdogMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(WatchdogMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &WatchdogMetricsInner {
        GLOBAL_METRICS.get_or_init(WatchdogMetricsInner::new)
    }

    pub fn observe_poll_cycle(&self, duration_secs: f64) {
        self.inner().poll_cycle_seconds.observe(duration_secs);
    }

    pub fn set_containers_monitored(&self, count: i64) {
        self.inner().containers_monitored.set(count);
    }

    pub fn inc_fetch_errors(&self) {
        self.inner().fetch_errors.inc();
    }

    pub fn inc_anomalies_detected(&self, metric: &str) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[metric])
            .inc();
    }

    pub fn inc_events_recorded(&self) {
        self.inner().events_recorded.inc();
    }

    pub fn inc_persistence_errors(&self) {
        self.inner().persistence_errors.inc();
    }

    pub fn set_pending_events(&self, count: i64) {
        self.inner().pending_events.set(count);
    }
}

/// Structured logger for watchdog events
///
/// Provides consistent JSON-formatted logging for anomalies, lifecycle
/// events and process lifecycle.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a per-container sample from a poll cycle
    pub fn log_report(&self, report: &EntityReport) {
        debug!(
            event = "container_sample",
            node = %self.node_name,
            container = %report.entity_name,
            cpu_percent = report.metrics.cpu_percent,
            mem_mb = report.metrics.mem_mb,
            rx_kb = report.metrics.rx_kb,
            tx_kb = report.metrics.tx_kb,
            anomalies = report.findings.len(),
            "Container sample"
        );
    }

    /// Log an anomaly detection event
    pub fn log_anomaly(&self, finding: &AnomalyFinding) {
        let severity = finding.severity();
        match severity {
            Severity::Critical => {
                warn!(
                    event = "anomaly_detected",
                    node = %self.node_name,
                    container = %finding.entity_name,
                    metric = %finding.metric_kind,
                    severity = %severity,
                    observed = finding.observed_value,
                    baseline_mean = finding.baseline_mean,
                    baseline_stddev = finding.baseline_stddev,
                    z_score = ?finding.z_score(),
                    "Critical anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    node = %self.node_name,
                    container = %finding.entity_name,
                    metric = %finding.metric_kind,
                    severity = %severity,
                    observed = finding.observed_value,
                    baseline_mean = finding.baseline_mean,
                    baseline_stddev = finding.baseline_stddev,
                    z_score = ?finding.z_score(),
                    "Anomaly detected"
                );
            }
        }
    }

    /// Log a persisted lifecycle event
    pub fn log_lifecycle_event(&self, event: &LifecycleEvent) {
        info!(
            event = "lifecycle_event_recorded",
            node = %self.node_name,
            container = %event.entity_name,
            event_type = %event.event_type,
            event_time = ?event.event_time,
            "Recorded container lifecycle event"
        );
    }

    /// Log watchdog startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "watchdog_started",
            node = %self.node_name,
            watchdog_version = %version,
            "Container watchdog started"
        );
    }

    /// Log watchdog shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "watchdog_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Container watchdog shutting down"
        );
    }
}
