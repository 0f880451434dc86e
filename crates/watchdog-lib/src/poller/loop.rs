//! Poll loop
//!
//! Periodically lists the running containers, fetches a counter snapshot for
//! each, normalizes it against the previous snapshot, checks it against the
//! container's baseline and folds it into history. One container failing
//! never aborts the cycle for the others.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::anomaly::{AnomalyDetector, HistoryRetention, RollingBaseline, DEFAULT_THRESHOLD};
use crate::error::{ConfigError, RuntimeError};
use crate::health::{components, HealthRegistry};
use crate::models::{CounterSnapshot, EntityRef, EntityReport};
use crate::normalizer;
use crate::observability::{StructuredLogger, WatchdogMetrics};
use crate::runtime::ContainerRuntime;

/// Configuration for the poll loop
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Pause between the end of one cycle and the start of the next (default: 60 seconds)
    pub interval: Duration,
    /// Upper bound on a single list or snapshot request (default: 10 seconds)
    pub fetch_timeout: Duration,
    /// Standard deviations above the mean that count as anomalous (default: 2)
    pub anomaly_threshold: f64,
    /// How much history each container's baseline keeps
    pub retention: HistoryRetention,
    /// Channel buffer size for per-container reports
    pub buffer_size: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            anomaly_threshold: DEFAULT_THRESHOLD,
            retention: HistoryRetention::default(),
            buffer_size: 1000,
        }
    }
}

impl PollConfig {
    /// Reject settings the loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidInterval);
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidFetchTimeout);
        }
        if !self.anomaly_threshold.is_finite() || self.anomaly_threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold(self.anomaly_threshold));
        }
        if let HistoryRetention::Window(size) = self.retention {
            if size < 2 {
                return Err(ConfigError::InvalidRetention(size));
            }
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        Ok(())
    }
}

/// Where the loop currently is within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Fetching,
    Normalizing,
    Detecting,
    Sleeping,
}

/// Results from a poll cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleResults {
    /// Containers returned by the runtime listing
    pub entities_seen: usize,
    /// Containers whose snapshot was fetched and analyzed
    pub success_count: usize,
    /// Containers skipped because their snapshot could not be fetched
    pub error_count: usize,
    /// Anomaly findings raised this cycle
    pub anomaly_count: usize,
    /// The container listing itself failed
    pub list_failed: bool,
    /// Shutdown was requested before the cycle finished
    pub cancelled: bool,
}

/// Poll loop that periodically samples every running container
pub struct PollLoop {
    runtime: Arc<dyn ContainerRuntime>,
    config: PollConfig,
    baseline: RollingBaseline,
    detector: AnomalyDetector,
    /// Last snapshot per container name
    previous: HashMap<String, CounterSnapshot>,
    reports_tx: mpsc::Sender<EntityReport>,
    state: PollState,
    metrics: Option<WatchdogMetrics>,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
}

impl PollLoop {
    /// Create a new poll loop
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: PollConfig,
    ) -> Result<(Self, mpsc::Receiver<EntityReport>), ConfigError> {
        config.validate()?;
        let (reports_tx, reports_rx) = mpsc::channel(config.buffer_size);

        let loop_instance = Self {
            runtime,
            baseline: RollingBaseline::new(config.retention),
            detector: AnomalyDetector::new(config.anomaly_threshold),
            config,
            previous: HashMap::new(),
            reports_tx,
            state: PollState::Idle,
            metrics: None,
            logger: None,
            health: None,
        };

        Ok((loop_instance, reports_rx))
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Read access to the per-container baselines
    pub fn baselines(&self) -> &RollingBaseline {
        &self.baseline
    }

    /// Number of containers with a cached previous snapshot
    pub fn cached_snapshots(&self) -> usize {
        self.previous.len()
    }

    /// Start the poll loop; returns once `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            threshold = self.config.anomaly_threshold,
            retention = ?self.config.retention,
            "Starting poll loop"
        );

        let mut cycle_count = 0u64;

        while !shutdown.is_cancelled() {
            let start = Instant::now();
            let results = self.run_cycle(&shutdown).await;
            cycle_count += 1;

            debug!(
                cycle = cycle_count,
                containers = results.entities_seen,
                sampled = results.success_count,
                errors = results.error_count,
                anomalies = results.anomaly_count,
                elapsed_ms = start.elapsed().as_millis(),
                "Poll cycle complete"
            );

            if results.cancelled {
                break;
            }

            self.transition(PollState::Sleeping);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            self.transition(PollState::Idle);
        }

        self.transition(PollState::Idle);
        info!(cycles = cycle_count, "Shutting down poll loop");
    }

    /// Run a single fetch, normalize, detect cycle over all containers.
    ///
    /// Cancellation is honoured between containers and while a request is
    /// in flight. A container is either fully processed or left untouched.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> CycleResults {
        let start = Instant::now();
        let mut results = CycleResults::default();
        let timeout = self.config.fetch_timeout;

        self.transition(PollState::Fetching);
        let listed = guarded(self.runtime.list_entities(), timeout, shutdown).await;
        let entities = match listed {
            None => {
                results.cancelled = true;
                return results;
            }
            Some(Ok(entities)) => entities,
            Some(Err(e)) => {
                warn!(error = %e, "Failed to list containers");
                results.list_failed = true;
                if let Some(metrics) = &self.metrics {
                    metrics.inc_fetch_errors();
                }
                if let Some(health) = &self.health {
                    health
                        .set_unhealthy(
                            components::RUNTIME,
                            format!("Container listing failed: {}", e),
                        )
                        .await;
                }
                return results;
            }
        };

        results.entities_seen = entities.len();
        self.forget_vanished(&entities);

        for entity in &entities {
            if shutdown.is_cancelled() {
                results.cancelled = true;
                break;
            }

            self.transition(PollState::Fetching);
            let fetched = guarded(self.runtime.fetch_snapshot(entity), timeout, shutdown).await;
            let snapshot = match fetched {
                None => {
                    results.cancelled = true;
                    break;
                }
                Some(Ok(snapshot)) => snapshot,
                Some(Err(e)) => {
                    results.error_count += 1;
                    self.handle_fetch_error(entity, e);
                    continue;
                }
            };

            let report = self.process_snapshot(entity, snapshot);
            results.success_count += 1;
            results.anomaly_count += report.findings.len();
            self.publish(report);
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_containers_monitored(results.entities_seen as i64);
            metrics.observe_poll_cycle(start.elapsed().as_secs_f64());
        }
        if let Some(health) = &self.health {
            if results.error_count > 0 {
                health
                    .set_degraded(
                        components::RUNTIME,
                        format!("Snapshot fetch failed for {} containers", results.error_count),
                    )
                    .await;
            } else {
                health.set_healthy(components::RUNTIME).await;
            }
            health.set_healthy(components::POLLER).await;
        }

        results
    }

    /// Normalize, check and record one container's snapshot
    fn process_snapshot(&mut self, entity: &EntityRef, snapshot: CounterSnapshot) -> EntityReport {
        self.transition(PollState::Normalizing);
        let metrics = match self.previous.get(&entity.name) {
            Some(prev) => normalizer::normalize(prev, &snapshot),
            None => normalizer::normalize_initial(&snapshot),
        };

        self.transition(PollState::Detecting);
        // Compare before recording so a sample never judges itself
        let baseline = self.baseline.baseline(&entity.name);
        let findings = self
            .detector
            .detect(&entity.name, &metrics, baseline.as_ref());
        self.baseline.record(&entity.name, &metrics);
        self.previous.insert(entity.name.clone(), snapshot);

        EntityReport {
            entity_name: entity.name.clone(),
            observed_at: Utc::now(),
            metrics,
            findings,
        }
    }

    /// Drop cached snapshots and baseline history of containers no longer listed
    fn forget_vanished(&mut self, entities: &[EntityRef]) {
        let live: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let vanished: Vec<String> = self
            .previous
            .keys()
            .chain(self.baseline.entities())
            .filter(|name| !live.contains(name.as_str()))
            .cloned()
            .collect();

        for name in vanished {
            if self.forget(&name) {
                debug!(container = %name, "Container vanished, dropping its state");
            }
        }
    }

    /// Drop everything kept for one container; true if anything was held
    fn forget(&mut self, name: &str) -> bool {
        let had_snapshot = self.previous.remove(name).is_some();
        let had_history = self.baseline.forget(name);
        had_snapshot || had_history
    }

    fn handle_fetch_error(&mut self, entity: &EntityRef, error: RuntimeError) {
        warn!(
            container = %entity.name,
            container_id = %entity.id,
            error = %error,
            "Failed to fetch container snapshot"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_fetch_errors();
        }
        if matches!(error, RuntimeError::NotFound(_)) {
            self.forget(&entity.name);
        }
    }

    /// Surface a report without ever blocking the next cycle
    fn publish(&self, report: EntityReport) {
        if let Some(logger) = &self.logger {
            logger.log_report(&report);
            for finding in &report.findings {
                logger.log_anomaly(finding);
            }
        }
        if let Some(metrics) = &self.metrics {
            for finding in &report.findings {
                metrics.inc_anomalies_detected(finding.metric_kind.as_str());
            }
        }

        match self.reports_tx.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(report)) => {
                warn!(
                    container = %report.entity_name,
                    "Report channel full, dropping container report"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Report channel closed");
            }
        }
    }

    fn transition(&mut self, next: PollState) {
        trace!(from = ?self.state, to = ?next, "Poll state transition");
        self.state = next;
    }
}

/// Await a runtime request bounded by `timeout`, or `None` on shutdown
async fn guarded<T, F>(
    request: F,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Option<Result<T, RuntimeError>>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    tokio::select! {
        _ = shutdown.cancelled() => None,
        result = tokio::time::timeout(timeout, request) => {
            Some(result.unwrap_or_else(|_| Err(RuntimeError::Timeout(timeout))))
        }
    }
}

/// Builder for creating the poll loop
pub struct PollLoopBuilder {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    config: PollConfig,
    metrics: Option<WatchdogMetrics>,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
}

impl PollLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            runtime: None,
            config: PollConfig::default(),
            metrics: None,
            logger: None,
            health: None,
        }
    }

    /// Set the container runtime
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the poll interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the per-request fetch timeout
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Set the anomaly threshold multiplier
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.config.anomaly_threshold = threshold;
        self
    }

    /// Set the history retention policy
    pub fn retention(mut self, retention: HistoryRetention) -> Self {
        self.config.retention = retention;
        self
    }

    /// Set the buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn metrics(mut self, metrics: WatchdogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the poll loop
    pub fn build(self) -> Result<(PollLoop, mpsc::Receiver<EntityReport>), ConfigError> {
        let runtime = self.runtime.ok_or(ConfigError::MissingRuntime)?;

        let (mut poll_loop, reports_rx) = PollLoop::new(runtime, self.config)?;
        poll_loop.metrics = self.metrics;
        poll_loop.logger = self.logger;
        poll_loop.health = self.health;

        Ok((poll_loop, reports_rx))
    }
}

impl Default for PollLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
