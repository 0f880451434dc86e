//! Rolling per-container baselines
//!
//! Keeps a history of CPU and memory samples for each container and derives
//! mean and sample standard deviation from it. History is either a fixed
//! window of the most recent samples or, when unbounded, a running
//! accumulator using Welford's online algorithm.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::models::MetricsRecord;

/// Default window size (24 hours at a 60 second poll interval)
pub const DEFAULT_HISTORY_WINDOW: usize = 1440;

/// Minimum samples before a baseline is considered established
const MIN_SAMPLES_FOR_BASELINE: u64 = 2;

/// How much history each container keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRetention {
    /// Keep only the last `n` samples
    Window(usize),
    /// Fold every sample ever recorded into the statistics
    Unbounded,
}

impl Default for HistoryRetention {
    fn default() -> Self {
        HistoryRetention::Window(DEFAULT_HISTORY_WINDOW)
    }
}

/// Reference statistics for one container
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Baseline {
    pub cpu_mean: f64,
    pub cpu_stddev: f64,
    pub mem_mean: f64,
    pub mem_stddev: f64,
    /// Number of samples the statistics were computed over
    pub samples: u64,
}

/// Summary statistics of a single series
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SeriesStats {
    count: u64,
    mean: f64,
    std_dev: f64,
}

/// History of one metric for one container
#[derive(Debug, Clone)]
enum MetricSeries {
    Window {
        samples: VecDeque<f64>,
        capacity: usize,
    },
    Running {
        count: u64,
        mean: f64,
        /// Sum of squared differences from the mean
        m2: f64,
    },
}

impl MetricSeries {
    fn new(retention: HistoryRetention) -> Self {
        match retention {
            HistoryRetention::Window(capacity) => MetricSeries::Window {
                samples: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
            },
            HistoryRetention::Unbounded => MetricSeries::Running {
                count: 0,
                mean: 0.0,
                m2: 0.0,
            },
        }
    }

    fn push(&mut self, value: f64) {
        match self {
            MetricSeries::Window { samples, capacity } => {
                while samples.len() >= *capacity {
                    samples.pop_front();
                }
                samples.push_back(value);
            }
            MetricSeries::Running { count, mean, m2 } => {
                *count += 1;
                let delta = value - *mean;
                *mean += delta / *count as f64;
                *m2 += delta * (value - *mean);
            }
        }
    }

    fn len(&self) -> u64 {
        match self {
            MetricSeries::Window { samples, .. } => samples.len() as u64,
            MetricSeries::Running { count, .. } => *count,
        }
    }

    fn stats(&self) -> SeriesStats {
        match self {
            MetricSeries::Window { samples, .. } => {
                let count = samples.len() as u64;
                if count == 0 {
                    return SeriesStats::default();
                }

                let mean = samples.iter().sum::<f64>() / count as f64;

                // Two-pass variance with Bessel's correction
                let std_dev = if count > 1 {
                    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                        / (count - 1) as f64;
                    variance.sqrt()
                } else {
                    0.0
                };

                SeriesStats {
                    count,
                    mean,
                    std_dev,
                }
            }
            MetricSeries::Running { count, mean, m2 } => SeriesStats {
                count: *count,
                mean: *mean,
                std_dev: if *count > 1 {
                    (*m2 / (*count - 1) as f64).sqrt()
                } else {
                    0.0
                },
            },
        }
    }
}

/// CPU and memory history for one container
#[derive(Debug, Clone)]
struct EntityHistory {
    cpu: MetricSeries,
    mem: MetricSeries,
}

impl EntityHistory {
    fn new(retention: HistoryRetention) -> Self {
        Self {
            cpu: MetricSeries::new(retention),
            mem: MetricSeries::new(retention),
        }
    }
}

/// Per-container rolling baselines.
///
/// Not synchronized: the poll loop is the only writer.
#[derive(Debug, Clone)]
pub struct RollingBaseline {
    retention: HistoryRetention,
    histories: HashMap<String, EntityHistory>,
}

impl RollingBaseline {
    pub fn new(retention: HistoryRetention) -> Self {
        Self {
            retention,
            histories: HashMap::new(),
        }
    }

    pub fn retention(&self) -> HistoryRetention {
        self.retention
    }

    /// Append a container's latest CPU and memory figures to its history
    pub fn record(&mut self, entity: &str, metrics: &MetricsRecord) {
        let retention = self.retention;
        let history = self
            .histories
            .entry(entity.to_string())
            .or_insert_with(|| EntityHistory::new(retention));

        history.cpu.push(metrics.cpu_percent);
        history.mem.push(metrics.mem_mb);
    }

    /// Current baseline for a container, `None` until it has 2 samples
    pub fn baseline(&self, entity: &str) -> Option<Baseline> {
        let history = self.histories.get(entity)?;
        let cpu = history.cpu.stats();
        let mem = history.mem.stats();

        if cpu.count < MIN_SAMPLES_FOR_BASELINE {
            return None;
        }

        Some(Baseline {
            cpu_mean: cpu.mean,
            cpu_stddev: cpu.std_dev,
            mem_mean: mem.mean,
            mem_stddev: mem.std_dev,
            samples: cpu.count,
        })
    }

    /// Number of samples currently retained for a container
    pub fn sample_count(&self, entity: &str) -> u64 {
        self.histories
            .get(entity)
            .map(|h| h.cpu.len())
            .unwrap_or(0)
    }

    /// Drop a container's history; true if it had any
    pub fn forget(&mut self, entity: &str) -> bool {
        self.histories.remove(entity).is_some()
    }

    /// Names of containers with any history
    pub fn entities(&self) -> impl Iterator<Item = &String> {
        self.histories.keys()
    }

    /// Number of containers with any history
    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

impl Default for RollingBaseline {
    fn default() -> Self {
        Self::new(HistoryRetention::default())
    }
}
