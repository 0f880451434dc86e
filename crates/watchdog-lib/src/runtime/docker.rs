//! Docker Engine API runtime
//!
//! Talks to the Docker daemon over HTTP:
//! - `GET /containers/json` for running containers
//! - `GET /containers/{id}/stats?stream=false` for counter snapshots
//! - `GET /events` for the newline-delimited lifecycle event stream

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use url::Url;

use super::{ContainerRuntime, EventStream};
use crate::error::RuntimeError;
use crate::models::{CounterSnapshot, EntityRef, InterfaceCounters, RawEvent};

/// Buffered events between the HTTP reader task and the consumer
const EVENT_CHANNEL_SIZE: usize = 256;

/// Only container events are of interest
const EVENTS_FILTER: &str = r#"{"type":["container"]}"#;

#[derive(Debug, Deserialize)]
struct DockerContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
}

impl DockerContainer {
    /// Container name with Docker's leading '/' stripped, short id as fallback
    fn clean_name(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.id.chars().take(12).collect())
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerStats {
    #[serde(default)]
    cpu_stats: DockerCpuStats,
    #[serde(default)]
    memory_stats: DockerMemoryStats,
    #[serde(default)]
    networks: Option<HashMap<String, DockerNetworkStats>>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerCpuStats {
    #[serde(default)]
    cpu_usage: DockerCpuUsage,
    #[serde(default)]
    system_cpu_usage: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerCpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct DockerMemoryStats {
    #[serde(default)]
    usage: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerNetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

impl From<DockerStats> for CounterSnapshot {
    fn from(stats: DockerStats) -> Self {
        CounterSnapshot {
            cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
            cpu_system_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            mem_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            network_ifaces: stats
                .networks
                .unwrap_or_default()
                .into_iter()
                .map(|(iface, n)| {
                    (
                        iface,
                        InterfaceCounters {
                            rx_bytes: n.rx_bytes,
                            tx_bytes: n.tx_bytes,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DockerEvent {
    #[serde(rename = "Type")]
    event_type: Option<String>,
    status: Option<String>,
    #[serde(rename = "Action")]
    action: Option<String>,
    #[serde(rename = "Actor")]
    actor: Option<DockerActor>,
    time: Option<i64>,
    #[serde(rename = "timeNano")]
    time_nano: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DockerActor {
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Decode one line of the `/events` stream.
///
/// Returns `None` for blank lines and for events that do not concern a
/// named container.
pub fn parse_event_line(line: &[u8]) -> Option<Result<RawEvent, RuntimeError>> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace())?;
    let line = &line[start..=end];

    let event: DockerEvent = match serde_json::from_slice(line) {
        Ok(event) => event,
        Err(e) => return Some(Err(RuntimeError::Decode(e.to_string()))),
    };

    if event.event_type.as_deref().is_some_and(|t| t != "container") {
        return None;
    }

    let status = event.action.or(event.status)?;
    let entity_name = event.actor?.attributes.remove("name")?;

    let time = match (event.time_nano, event.time) {
        (Some(nanos), _) => Utc
            .timestamp_opt(nanos.div_euclid(1_000_000_000), nanos.rem_euclid(1_000_000_000) as u32)
            .single(),
        (None, Some(secs)) => Utc.timestamp_opt(secs, 0).single(),
        (None, None) => None,
    };

    Some(Ok(RawEvent {
        entity_name,
        status,
        time,
    }))
}

/// Runtime backed by the Docker Engine HTTP API
pub struct DockerRuntime {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl DockerRuntime {
    /// Create a runtime client for a daemon listening at `endpoint`
    /// (for example `http://localhost:2375`)
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, RuntimeError> {
        let mut base_url = Url::parse(endpoint)
            .map_err(|e| {
                RuntimeError::Unreachable(format!("invalid endpoint {}: {}", endpoint, e))
            })?;

        // Url::join replaces the last path segment unless it ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        // No client-wide timeout: it would also cut the long-lived event stream
        let client = Client::builder()
            .build()
            .map_err(|e| {
                RuntimeError::Unreachable(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, RuntimeError> {
        self.base_url
            .join(path)
            .map_err(|e| RuntimeError::Unreachable(format!("invalid path {}: {}", path, e)))
    }

    fn map_request_error(&self, e: reqwest::Error) -> RuntimeError {
        if e.is_timeout() {
            RuntimeError::Timeout(self.request_timeout)
        } else {
            RuntimeError::from(e)
        }
    }

    async fn check_status(
        response: Response,
        container_id: Option<&str>,
    ) -> Result<Response, RuntimeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::NOT_FOUND {
            if let Some(id) = container_id {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
        }

        let message = response.text().await.unwrap_or_default();
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_entities(&self) -> Result<Vec<EntityRef>, RuntimeError> {
        let response = self
            .client
            .get(self.url("containers/json")?)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let containers: Vec<DockerContainer> = Self::check_status(response, None)
            .await?
            .json()
            .await
            .map_err(|e| self.map_request_error(e))?;

        Ok(containers
            .iter()
            .map(|c| EntityRef::new(c.id.clone(), c.clean_name()))
            .collect())
    }

    async fn fetch_snapshot(&self, entity: &EntityRef) -> Result<CounterSnapshot, RuntimeError> {
        let path = format!("containers/{}/stats", entity.id);
        let response = self
            .client
            .get(self.url(&path)?)
            .query(&[("stream", "false"), ("one-shot", "true")])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let stats: DockerStats = Self::check_status(response, Some(&entity.id))
            .await?
            .json()
            .await
            .map_err(|e| self.map_request_error(e))?;

        debug!(container = %entity.name, "Fetched container stats");
        Ok(stats.into())
    }

    async fn event_stream(&self) -> Result<EventStream, RuntimeError> {
        let response = self
            .client
            .get(self.url("events")?)
            .query(&[("filters", EVENTS_FILTER)])
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let mut response = Self::check_status(response, None).await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        info!(endpoint = %self.base_url, "Subscribed to runtime event stream");

        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();

            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            if let Some(item) = parse_event_line(&line) {
                                if tx.send(item).await.is_err() {
                                    debug!("Event stream consumer dropped");
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Runtime event stream failed");
                        let _ = tx.send(Err(RuntimeError::from(e))).await;
                        return;
                    }
                }
            }

            if let Some(item) = parse_event_line(&buf) {
                let _ = tx.send(item).await;
            }
            debug!("Runtime event stream closed by daemon");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
