//! Periodic sampling of running containers
//!
//! The poll loop owns the polling cadence, the previous-snapshot cache and
//! the per-container baselines. Each cycle moves through
//! `Idle -> Fetching -> Normalizing -> Detecting -> Sleeping` and publishes
//! one [`EntityReport`](crate::models::EntityReport) per sampled container.

mod r#loop;


pub use r#loop::{CycleResults, PollConfig, PollLoop, PollLoopBuilder, PollState};
