//! Container runtime access
//!
//! The watchdog only needs three things from a runtime: the list of running
//! containers, a counter snapshot per container, and a stream of lifecycle
//! events. `DockerRuntime` provides them over the Docker Engine HTTP API.

mod docker;

pub use docker::{parse_event_line, DockerRuntime};

use std::pin::Pin;

use tokio_stream::Stream;

use crate::error::RuntimeError;
use crate::models::{CounterSnapshot, EntityRef, RawEvent};

pub use async_trait::async_trait;

/// Lazy, non-restartable stream of runtime lifecycle events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, RuntimeError>> + Send>>;

/// Trait for container runtime implementations
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List the currently running containers
    async fn list_entities(&self) -> Result<Vec<EntityRef>, RuntimeError>;

    /// Read the cumulative resource counters of one container
    async fn fetch_snapshot(&self, entity: &EntityRef) -> Result<CounterSnapshot, RuntimeError>;

    /// Subscribe to container lifecycle events
    async fn event_stream(&self) -> Result<EventStream, RuntimeError>;
}
