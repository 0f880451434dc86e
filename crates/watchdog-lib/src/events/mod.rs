//! Container lifecycle event log
//!
//! - `EventStore`: durable, append-only SQLite log of lifecycle events
//! - `EventRecorder`: feeds the runtime event stream into the store

mod recorder;
mod store;

pub use recorder::{EventRecorder, RecorderConfig, RecorderStats};
pub use store::{EventFilter, EventStore};
