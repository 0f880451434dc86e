//! Lifecycle event recording
//!
//! Drains the runtime's event stream into the [`EventStore`]. Events whose
//! append failed are held in a bounded queue and retried before the next
//! append, so a transient storage failure does not lose audit records.
//!
//! When the runtime closes its event stream the recorder resubscribes with
//! exponential backoff until shutdown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EventStore;
use crate::error::PersistenceError;
use crate::health::{components, HealthRegistry};
use crate::models::LifecycleEvent;
use crate::observability::{StructuredLogger, WatchdogMetrics};
use crate::runtime::{ContainerRuntime, EventStream};

/// Default bound on events awaiting a retried append
const DEFAULT_MAX_PENDING: usize = 1000;

/// Configuration for the event recorder
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Event types to persist; empty persists everything
    pub event_types: Vec<String>,
    /// Maximum events buffered while the store is failing
    pub max_pending: usize,
    /// First wait before resubscribing to a closed event stream
    pub initial_backoff: Duration,
    /// Upper bound for the doubling resubscribe wait
    pub max_backoff: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            event_types: Vec::new(),
            max_pending: DEFAULT_MAX_PENDING,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Counters describing a recorder run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecorderStats {
    /// Events committed to the store
    pub recorded: u64,
    /// Events skipped by the type allow-list
    pub filtered: u64,
    /// Events lost because the pending queue overflowed
    pub dropped: u64,
    /// Events still pending when the recorder stopped
    pub pending: usize,
}

/// Persists runtime lifecycle events
pub struct EventRecorder {
    store: EventStore,
    config: RecorderConfig,
    pending: VecDeque<LifecycleEvent>,
    stats: RecorderStats,
    /// Events dropped since the pending queue last drained
    dropped_since_drain: u64,
    metrics: Option<WatchdogMetrics>,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
}

impl EventRecorder {
    pub fn new(store: EventStore, config: RecorderConfig) -> Self {
        Self {
            store,
            config,
            pending: VecDeque::new(),
            stats: RecorderStats::default(),
            dropped_since_drain: 0,
            metrics: None,
            logger: None,
            health: None,
        }
    }

    /// Report recorded events and persistence failures to Prometheus
    pub fn with_metrics(mut self, metrics: WatchdogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Emit a structured log line for each recorded event
    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Mirror store and subscription state into the health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Consume `stream` until it ends or `shutdown` is cancelled
    pub async fn run(mut self, stream: EventStream, shutdown: CancellationToken) -> RecorderStats {
        info!("Starting lifecycle event recorder");
        self.consume(stream, &shutdown).await;
        self.finish().await
    }

    /// Subscribe to `runtime` events until `shutdown`, resubscribing with
    /// exponential backoff whenever the subscription fails or the stream ends
    pub async fn run_with_reconnect(
        mut self,
        runtime: Arc<dyn ContainerRuntime>,
        shutdown: CancellationToken,
    ) -> RecorderStats {
        info!("Starting lifecycle event recorder");
        let mut backoff = self.config.initial_backoff;
        let mut attempts: u32 = 0;

        while !shutdown.is_cancelled() {
            let subscribed = tokio::select! {
                _ = shutdown.cancelled() => break,
                subscribed = runtime.event_stream() => subscribed,
            };

            let reason = match subscribed {
                Ok(stream) => {
                    attempts = 0;
                    backoff = self.config.initial_backoff;
                    self.set_recorder_health(None).await;
                    self.consume(stream, &shutdown).await;
                    if shutdown.is_cancelled() {
                        break;
                    }
                    "Runtime event stream ended".to_string()
                }
                Err(e) => format!("Failed to subscribe to runtime events: {}", e),
            };

            attempts += 1;
            warn!(
                reason = %reason,
                attempts,
                next_backoff_ms = backoff.as_millis() as u64,
                "Lifecycle event subscription lost, resubscribing"
            );
            self.set_recorder_health(Some(reason)).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        self.finish().await
    }

    /// Handle items from one subscription until it ends or shutdown
    async fn consume(&mut self, mut stream: EventStream, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down lifecycle event recorder");
                    return;
                }
                item = stream.next() => {
                    match item {
                        Some(Ok(raw)) => self.handle(raw.into()).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "Error reading runtime event stream");
                        }
                        None => {
                            warn!("Runtime event stream ended");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Last flush attempt before the recorder stops
    async fn finish(mut self) -> RecorderStats {
        self.flush_pending().await;
        self.update_store_health().await;
        self.stats.pending = self.pending.len();
        if !self.pending.is_empty() {
            error!(
                pending = self.pending.len(),
                "Lifecycle events could not be persisted before shutdown"
            );
        }
        self.stats
    }

    /// Persist one event, retrying anything still pending first
    pub async fn handle(&mut self, event: LifecycleEvent) {
        if !self.accepts(&event.event_type) {
            self.stats.filtered += 1;
            debug!(
                container = %event.entity_name,
                event_type = %event.event_type,
                "Skipping filtered event type"
            );
            return;
        }

        self.flush_pending().await;

        if !self.pending.is_empty() {
            // Keep insertion order: nothing jumps ahead of a failed event
            self.enqueue(event);
        } else if let Err(e) = self.persist(&event).await {
            warn!(
                error = %e,
                container = %event.entity_name,
                event_type = %event.event_type,
                "Failed to persist lifecycle event, buffering for retry"
            );
            self.enqueue(event);
        }

        self.update_store_health().await;
    }

    /// Number of events waiting for a retried append
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    fn accepts(&self, event_type: &str) -> bool {
        self.config.event_types.is_empty()
            || self.config.event_types.iter().any(|t| t == event_type)
    }

    async fn persist(&mut self, event: &LifecycleEvent) -> Result<(), PersistenceError> {
        match self.store.append(event).await {
            Ok(_) => {
                self.stats.recorded += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.inc_events_recorded();
                }
                if let Some(logger) = &self.logger {
                    logger.log_lifecycle_event(event);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_persistence_errors();
                }
                Err(e)
            }
        }
    }

    async fn flush_pending(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            if let Err(e) = self.persist(&event).await {
                debug!(
                    error = %e,
                    pending = self.pending.len() + 1,
                    "Retry of pending event failed"
                );
                self.pending.push_front(event);
                break;
            }
        }
        if self.pending.is_empty() {
            self.dropped_since_drain = 0;
        }
        self.update_pending_gauge();
    }

    fn enqueue(&mut self, event: LifecycleEvent) {
        while self.pending.len() >= self.config.max_pending.max(1) {
            if let Some(lost) = self.pending.pop_front() {
                self.stats.dropped += 1;
                self.dropped_since_drain += 1;
                error!(
                    container = %lost.entity_name,
                    event_type = %lost.event_type,
                    "Pending event queue full, dropping oldest lifecycle event"
                );
            }
        }
        self.pending.push_back(event);
        self.update_pending_gauge();
    }

    fn update_pending_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_pending_events(self.pending.len() as i64);
        }
    }

    /// Healthy with an empty queue, degraded while events await retry,
    /// unhealthy once the queue has overflowed and lost events
    async fn update_store_health(&self) {
        let health = match &self.health {
            Some(health) => health,
            None => return,
        };

        if self.pending.is_empty() {
            health.set_healthy(components::EVENT_STORE).await;
        } else if self.dropped_since_drain > 0 {
            health
                .set_unhealthy(
                    components::EVENT_STORE,
                    format!(
                        "Pending event queue overflowed, {} lifecycle events dropped",
                        self.dropped_since_drain
                    ),
                )
                .await;
        } else {
            health
                .set_degraded(
                    components::EVENT_STORE,
                    format!("{} lifecycle events awaiting retry", self.pending.len()),
                )
                .await;
        }
    }

    async fn set_recorder_health(&self, problem: Option<String>) {
        if let Some(health) = &self.health {
            match problem {
                None => health.set_healthy(components::EVENT_RECORDER).await,
                Some(message) => health.set_unhealthy(components::EVENT_RECORDER, message).await,
            }
        }
    }
}
