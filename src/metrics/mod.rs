//! Metrics collaborator interface.
//!
//! The scheduler reports through [`MetricSender`] using statsd-style names
//! and `key:value` tags. Backends decide how to materialize them.

pub mod prometheus;
pub mod recording;

pub use self::prometheus::PrometheusSender;
pub use self::recording::{MetricCall, RecordingSender};

pub const PATH_MONITORED: &str = "network_path.path.monitored";
pub const SCHEDULE_DURATION: &str = "network_path.scheduler.schedule_duration";
pub const FLUSH_DURATION: &str = "network_path.scheduler.flush_duration";
pub const FLUSH_INTERVAL: &str = "network_path.scheduler.flush_interval";
pub const WORKERS: &str = "network_path.scheduler.workers";
pub const PATHTEST_STORE_SIZE: &str = "network_path.scheduler.pathtest_store_size";
pub const PATHTEST_FLUSHED_COUNT: &str = "network_path.scheduler.pathtest_flushed_count";
pub const PATHTEST_DROPPED: &str = "network_path.scheduler.pathtest_dropped";
pub const CHECK_DURATION: &str = "network_path.check_duration";
pub const CHECK_INTERVAL: &str = "network_path.check_interval";

/// Gauge/count emission API.
pub trait MetricSender: Send + Sync {
    /// Record the current value of a gauge.
    fn gauge(&self, name: &str, value: f64, tags: &[String], rate: f64);

    /// Add `value` to a monotonic counter.
    fn count(&self, name: &str, value: f64, tags: &[String], rate: f64);

    /// Drop every series recorded with exactly `tags`.
    ///
    /// Called once the destination those tags describe is no longer
    /// scheduled. Backends without per-series state ignore it.
    fn forget(&self, _tags: &[String]) {}
}

/// Sender that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSender;

impl MetricSender for NoopSender {
    fn gauge(&self, _name: &str, _value: f64, _tags: &[String], _rate: f64) {}

    fn count(&self, _name: &str, _value: f64, _tags: &[String], _rate: f64) {}
}
