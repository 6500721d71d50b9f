//! Connection-driven network path discovery.
//!
//! Outgoing connections observed on the host are turned into deduplicated
//! path tests, probed periodically with traceroute and forwarded downstream
//! as `NetworkPath` events.

pub mod agent;
pub mod config;
pub mod connection;
pub mod export;
pub mod forwarder;
pub mod metrics;
pub mod pathtest;
pub mod payload;
pub mod probe;
pub mod sampler;
pub mod scheduler;

pub use scheduler::{Scheduler, SchedulerError, SchedulerState};
