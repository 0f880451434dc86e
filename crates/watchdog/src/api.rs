//! HTTP API for health checks, Prometheus metrics and the event log

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use watchdog_lib::{
    events::{EventFilter, EventStore},
    health::{ComponentStatus, HealthRegistry},
    models::{EntityReport, StoredEvent},
};

/// Events returned when the caller gives no limit
const DEFAULT_EVENT_LIMIT: u32 = 1000;

/// Hard cap on a single events page
const MAX_EVENT_LIMIT: u32 = 10_000;

/// Most recent report per container name
pub type LatestReports = Arc<RwLock<HashMap<String, EntityReport>>>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub store: EventStore,
    pub latest: LatestReports,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, store: EventStore, latest: LatestReports) -> Self {
        Self {
            health_registry,
            store,
            latest,
        }
    }
}

/// Query parameters accepted by `/events`
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub container: Option<String>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl EventsQuery {
    fn into_filter(self) -> EventFilter {
        EventFilter {
            entity_name: self.container,
            event_type: self.event_type,
            since: self.since,
            until: self.until,
            limit: Some(self.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT)),
        }
    }
}

/// Error body for failed API calls
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::internal(format!("Failed to encode metrics: {}", e)))?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    ))
}

/// Lifecycle events from the persistent log, oldest first
async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    let filter = query.into_filter();

    let events = state.store.query(&filter).await.map_err(|e| {
        error!(error = %e, "Failed to query event store");
        ApiError::internal("Failed to query event store")
    })?;

    Ok(Json(events))
}

/// Latest sample and findings for every container seen
async fn containers(State(state): State<Arc<AppState>>) -> Json<Vec<EntityReport>> {
    let latest = state.latest.read().await;
    let mut reports: Vec<EntityReport> = latest.values().cloned().collect();
    reports.sort_by(|a, b| a.entity_name.cmp(&b.entity_name));
    Json(reports)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/events", get(events))
        .route("/containers", get(containers))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::TimeZone;
    use tower::ServiceExt;
    use watchdog_lib::{
        health::components,
        models::{LifecycleEvent, MetricsRecord},
        observability::WatchdogMetrics,
    };

    async fn setup_test_app() -> (Router, Arc<AppState>) {
        let health_registry = HealthRegistry::new();
        health_registry.register(components::POLLER).await;
        health_registry.register(components::EVENT_STORE).await;

        let store = EventStore::open_in_memory().await.unwrap();
        let state = Arc::new(AppState::new(
            health_registry,
            store,
            LatestReports::default(),
        ));

        (create_router(state.clone()), state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_healthz_endpoint_healthy() {
        let (app, _) = setup_test_app().await;

        let (status, body) = get_json(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_healthz_endpoint_degraded_still_ok() {
        let (app, state) = setup_test_app().await;
        state
            .health_registry
            .set_degraded(components::POLLER, "slow cycle")
            .await;

        let (status, body) = get_json(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_healthz_endpoint_unhealthy() {
        let (app, state) = setup_test_app().await;
        state
            .health_registry
            .set_unhealthy(components::EVENT_STORE, "disk full")
            .await;

        let (status, _) = get_json(app, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_endpoint() {
        let (app, state) = setup_test_app().await;

        let (status, _) = get_json(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.health_registry.set_ready(true).await;
        let (status, body) = get_json(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = setup_test_app().await;
        WatchdogMetrics::new().inc_events_recorded();

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("container_watchdog_events_recorded_total"));
    }

    #[tokio::test]
    async fn test_events_endpoint_filters() {
        let (app, state) = setup_test_app().await;
        let t = |h| Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap();

        for (name, kind, hour) in [
            ("web", "start", 8),
            ("db", "start", 9),
            ("web", "die", 10),
            ("web", "start", 11),
        ] {
            state
                .store
                .append(&LifecycleEvent::new(name, kind).at(t(hour)))
                .await
                .unwrap();
        }

        let (status, body) = get_json(app.clone(), "/events").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 4);

        let (_, body) = get_json(app.clone(), "/events?container=web&event_type=start").await;
        let events = body.as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e["entity_name"] == "web"));

        let (_, body) = get_json(
            app.clone(),
            "/events?since=2024-05-01T09:00:00Z&until=2024-05-01T10:00:00Z",
        )
        .await;
        let events = body.as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["entity_name"], "db");
        assert_eq!(events[1]["event_type"], "die");

        let (_, body) = get_json(app, "/events?limit=1").await;
        let events = body.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event_type"], "start");
        assert_eq!(events[0]["entity_name"], "web");
    }

    #[tokio::test]
    async fn test_events_endpoint_rejects_bad_timestamp() {
        let (app, _) = setup_test_app().await;

        let (status, _) = get_json(app, "/events?since=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_events_endpoint_store_failure() {
        let (app, state) = setup_test_app().await;
        state.store.close().await;

        let (status, body) = get_json(app, "/events").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to query event store");
    }

    #[tokio::test]
    async fn test_containers_endpoint_sorted() {
        let (app, state) = setup_test_app().await;
        {
            let mut latest = state.latest.write().await;
            for name in ["web", "cache"] {
                latest.insert(
                    name.to_string(),
                    EntityReport {
                        entity_name: name.to_string(),
                        observed_at: Utc::now(),
                        metrics: MetricsRecord {
                            mem_mb: 12.5,
                            ..Default::default()
                        },
                        findings: Vec::new(),
                    },
                );
            }
        }

        let (status, body) = get_json(app, "/containers").await;
        assert_eq!(status, StatusCode::OK);
        let reports = body.as_array().unwrap();
        assert_eq!(reports[0]["entity_name"], "cache");
        assert_eq!(reports[1]["entity_name"], "web");
        assert_eq!(reports[1]["metrics"]["mem_mb"], 12.5);
    }
}
