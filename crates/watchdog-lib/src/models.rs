//! Core data models for the container watchdog

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::anomaly::AnomalyFinding;

/// Identity of a monitored container as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Runtime identifier used for API calls
    pub id: String,
    /// Human-readable name, the key for all per-container state
    pub name: String,
}

impl EntityRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Cumulative network counters for one interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Point-in-time read of a container's cumulative resource counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Total CPU time consumed by the container (nanoseconds)
    pub cpu_total_usage: u64,
    /// Total CPU time of the host (nanoseconds)
    pub cpu_system_usage: u64,
    /// Current memory usage in bytes
    pub mem_usage_bytes: u64,
    /// Per-interface network counters, empty when the runtime reports none
    #[serde(default)]
    pub network_ifaces: HashMap<String, InterfaceCounters>,
}

/// Normalized resource usage derived from counter snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub cpu_percent: f64,
    pub mem_mb: f64,
    pub rx_kb: f64,
    pub tx_kb: f64,
}

/// Lifecycle event to be appended to the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub entity_name: String,
    pub event_type: String,
    /// When the runtime observed the event; the store stamps write time if absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
}

impl LifecycleEvent {
    pub fn new(entity_name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            event_type: event_type.into(),
            event_time: None,
        }
    }

    pub fn at(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }
}

/// Lifecycle event as read back from the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub entity_name: String,
    pub event_type: String,
    pub event_time: DateTime<Utc>,
}

/// Raw lifecycle payload produced by the runtime event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub entity_name: String,
    pub status: String,
    pub time: Option<DateTime<Utc>>,
}

impl From<RawEvent> for LifecycleEvent {
    fn from(raw: RawEvent) -> Self {
        Self {
            entity_name: raw.entity_name,
            event_type: raw.status,
            event_time: raw.time,
        }
    }
}

/// Per-container output of one poll cycle, consumed by reporting
#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub entity_name: String,
    pub observed_at: DateTime<Utc>,
    pub metrics: MetricsRecord,
    pub findings: Vec<AnomalyFinding>,
}
