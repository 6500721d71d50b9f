//! Connection-driven path discovery scheduler.
//!
//! Observed connections are deduplicated into path tests, flushed to a
//! worker pool every `flush_interval` and probed. Discovered paths are
//! forwarded downstream together with per-test telemetry.
//!
//! Task layout while running:
//!
//! ```text
//! schedule_conns ──try_send──▶ input queue ──▶ listener ──▶ store
//!                                                             │ flush loop
//!                                                             ▼
//!                  forwarder ◀── worker × N ◀── processing queue
//! ```

mod flush;
mod ingest;
mod listener;
pub mod queue;
mod worker;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkPathConfig;
use crate::forwarder::Forwarder;
use crate::metrics::MetricSender;
use crate::pathtest::store::PathTestStore;
use crate::pathtest::{PathTest, PathTestContext};
use crate::probe::Probe;

use self::queue::Queue;

/// Wall-clock source. Replaceable for tests.
pub type TimeFn = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Errors returned by lifecycle operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,
}

/// Lifecycle state of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by every scheduler task.
struct Shared<P, F> {
    cfg: NetworkPathConfig,
    probe: Arc<P>,
    forwarder: Arc<F>,
    metrics: Arc<dyn MetricSender>,
    time_fn: TimeFn,

    /// Absent when the scheduler is disabled.
    input: Option<Queue<PathTest>>,
    processing: Option<Queue<PathTestContext>>,

    /// Locked by the listener (add) and the flush loop (flush), never
    /// across an await.
    store: parking_lot::Mutex<PathTestStore>,

    /// Telemetry tags last emitted per path test. Pruned against the store
    /// on every flush so per-destination series go away with their test.
    series: parking_lot::Mutex<HashMap<PathTest, Vec<String>>>,

    received: AtomicU64,
    processed: AtomicU64,
}

impl<P, F> Shared<P, F> {
    fn now(&self) -> SystemTime {
        (self.time_fn)()
    }
}

#[derive(Default)]
struct Lifecycle {
    state: SchedulerState,
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

/// Path discovery scheduler.
///
/// Generic over the probe and forwarder collaborators. Lifecycle methods
/// take `&self` so the scheduler can be shared behind an `Arc` with the
/// connection sampler.
pub struct Scheduler<P, F> {
    shared: Arc<Shared<P, F>>,
    lifecycle: parking_lot::Mutex<Lifecycle>,
    /// Held for the whole of `stop()` so concurrent callers wait for the
    /// first one to finish joining.
    stopping: tokio::sync::Mutex<()>,
}

/// Returns the lifecycle to `Stopped` when a stop completes or its future
/// is dropped mid-join.
struct StoppedOnDrop<'a>(&'a parking_lot::Mutex<Lifecycle>);

impl Drop for StoppedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.lock().state = SchedulerState::Stopped;
    }
}

impl<P: Probe, F: Forwarder> Scheduler<P, F> {
    /// Creates a scheduler using the system clock.
    pub fn new(
        cfg: NetworkPathConfig,
        probe: Arc<P>,
        forwarder: Arc<F>,
        metrics: Arc<dyn MetricSender>,
    ) -> Result<Self> {
        Self::with_clock(cfg, probe, forwarder, metrics, Arc::new(SystemTime::now))
    }

    /// Creates a scheduler reading time from `time_fn`.
    pub fn with_clock(
        cfg: NetworkPathConfig,
        probe: Arc<P>,
        forwarder: Arc<F>,
        metrics: Arc<dyn MetricSender>,
        time_fn: TimeFn,
    ) -> Result<Self> {
        cfg.validate().context("invalid network_path config")?;

        let (input, processing) = if cfg.enabled {
            (
                Some(Queue::new(cfg.input_queue_size)),
                Some(Queue::new(cfg.processing_queue_size)),
            )
        } else {
            (None, None)
        };

        let store = PathTestStore::new(&cfg.store);

        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                probe,
                forwarder,
                metrics,
                time_fn,
                input,
                processing,
                store: parking_lot::Mutex::new(store),
                series: parking_lot::Mutex::new(HashMap::new()),
                received: AtomicU64::new(0),
                processed: AtomicU64::new(0),
            }),
            lifecycle: parking_lot::Mutex::new(Lifecycle::default()),
            stopping: tokio::sync::Mutex::new(()),
        })
    }

    /// Launch the listener, flush loop and worker pool.
    ///
    /// Must be called from within a tokio runtime. A disabled scheduler
    /// accepts the call and stays inert.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SchedulerState::Stopped {
            return Err(SchedulerError::AlreadyStarted);
        }

        let shared = &self.shared;
        let (Some(input), Some(_)) = (&shared.input, &shared.processing) else {
            debug!("network path scheduler disabled, not starting");
            return Ok(());
        };

        lifecycle.state = SchedulerState::Starting;
        info!(
            workers = shared.cfg.workers,
            flush_interval = ?shared.cfg.flush_interval,
            "starting network path scheduler",
        );

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(shared.cfg.workers + 2);

        handles.push(tokio::spawn(listener::run_listener(
            Arc::clone(shared),
            input.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(flush::run_flush_loop(
            Arc::clone(shared),
            cancel.clone(),
        )));

        info!(workers = shared.cfg.workers, "starting workers");
        for id in 0..shared.cfg.workers {
            handles.push(tokio::spawn(worker::run_worker(
                Arc::clone(shared),
                id,
                cancel.clone(),
            )));
        }

        lifecycle.cancel = Some(cancel);
        lifecycle.handles = handles;
        lifecycle.state = SchedulerState::Running;

        Ok(())
    }

    /// Signal every task to stop and wait for all of them to exit.
    ///
    /// No-op unless running. A call made while another stop is in progress
    /// returns once that stop has finished.
    pub async fn stop(&self) {
        let _serial = self.stopping.lock().await;

        let (cancel, handles) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != SchedulerState::Running {
                return;
            }
            lifecycle.state = SchedulerState::Stopping;
            (lifecycle.cancel.take(), std::mem::take(&mut lifecycle.handles))
        };
        let stopped = StoppedOnDrop(&self.lifecycle);

        info!("stopping network path scheduler");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task panicked");
            }
        }

        drop(stopped);
        info!("network path scheduler stopped");
    }

    pub fn state(&self) -> SchedulerState {
        self.lifecycle.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.cfg.enabled
    }

    /// Path tests received by the listener since construction.
    pub fn received_count(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Probe runs completed by workers since construction.
    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Number of distinct path tests currently registered.
    pub fn store_len(&self) -> usize {
        self.shared.store.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testutil::*;
    use super::*;

    #[test]
    fn test_new_rejects_invalid_config() {
        let probe = Arc::new(StubProbe::two_hops());
        let forwarder = Arc::new(StubForwarder::default());
        let metrics = Arc::new(crate::metrics::NoopSender);

        let result = Scheduler::new(
            NetworkPathConfig {
                workers: 0,
                ..enabled_config()
            },
            probe,
            forwarder,
            metrics,
        );
        let err = result.err().expect("must fail");
        assert!(format!("{err:#}").contains("workers must be positive"), "{err:#}");
    }

    #[test]
    fn test_default_queue_sizes() {
        let h = harness(enabled_config());
        let shared = &h.scheduler.shared;
        assert_eq!(shared.cfg.workers, 4);
        assert_eq!(shared.input.as_ref().map(Queue::capacity), Some(1000));
        assert_eq!(shared.processing.as_ref().map(Queue::capacity), Some(1000));
    }

    #[test]
    fn test_overridden_queue_sizes() {
        let h = harness(NetworkPathConfig {
            workers: 2,
            input_queue_size: 300,
            processing_queue_size: 400,
            ..enabled_config()
        });
        let shared = &h.scheduler.shared;
        assert_eq!(shared.cfg.workers, 2);
        assert_eq!(shared.input.as_ref().map(Queue::capacity), Some(300));
        assert_eq!(shared.processing.as_ref().map(Queue::capacity), Some(400));
    }

    #[tokio::test]
    async fn test_disabled_scheduler_is_inert() {
        let h = harness(NetworkPathConfig::default());
        assert!(!h.scheduler.is_enabled());
        assert!(h.scheduler.shared.input.is_none());

        h.scheduler.start().expect("start");
        assert!(!h.scheduler.is_running());
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
        h.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_logs_once() {
        let (logs, _guard) = capture_logs();
        let h = harness(NetworkPathConfig {
            workers: 2,
            ..enabled_config()
        });

        assert!(!h.scheduler.is_running());
        h.scheduler.start().expect("first start");
        assert!(h.scheduler.is_running());
        assert_eq!(h.scheduler.start(), Err(SchedulerError::AlreadyStarted));

        // Let every task log its start line.
        tokio::task::yield_now().await;
        h.scheduler.stop().await;
        assert!(!h.scheduler.is_running());

        assert_eq!(logs.count("starting network path scheduler"), 1, "{}", logs.contents());
        assert_eq!(logs.count("listener started"), 1, "{}", logs.contents());
        assert_eq!(logs.count("flush loop started"), 1, "{}", logs.contents());
        assert_eq!(logs.count("starting workers"), 1, "{}", logs.contents());
        assert_eq!(logs.count("worker started worker=0"), 1, "{}", logs.contents());
        assert_eq!(logs.count("worker started worker=1"), 1, "{}", logs.contents());

        assert_eq!(logs.count("listener stopped"), 1, "{}", logs.contents());
        assert_eq!(logs.count("flush loop stopped"), 1, "{}", logs.contents());
        assert_eq!(logs.count("worker stopped worker=0"), 1, "{}", logs.contents());
        assert_eq!(logs.count("worker stopped worker=1"), 1, "{}", logs.contents());
        assert_eq!(logs.count("network path scheduler stopped"), 1, "{}", logs.contents());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let h = harness(enabled_config());
        h.scheduler.stop().await;
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);

        h.scheduler.start().expect("start");
        h.scheduler.stop().await;
        h.scheduler.stop().await;
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let h = harness(NetworkPathConfig {
            flush_interval: Duration::from_millis(20),
            ..enabled_config()
        });

        h.scheduler.start().expect("start");
        h.scheduler.stop().await;

        h.scheduler.start().expect("restart");
        h.scheduler.schedule_conns(&[outgoing("10.0.0.1", "10.0.0.2", 443)]);
        wait_for(|| h.scheduler.processed_count() >= 1).await;
        h.scheduler.stop().await;

        assert_eq!(h.scheduler.received_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_stop_waits_for_tasks() {
        let (logs, _guard) = capture_logs();
        let h = harness(NetworkPathConfig {
            workers: 2,
            ..enabled_config()
        });
        h.scheduler.start().expect("start");
        tokio::task::yield_now().await;

        let first = h.scheduler.stop();
        let second = h.scheduler.stop();
        tokio::pin!(first, second);

        let first_done = tokio::select! {
            biased;
            _ = &mut first => true,
            _ = &mut second => false,
        };

        assert_eq!(logs.count("listener stopped"), 1, "{}", logs.contents());
        assert_eq!(logs.count("flush loop stopped"), 1, "{}", logs.contents());
        assert_eq!(logs.count("worker stopped worker=0"), 1, "{}", logs.contents());
        assert_eq!(logs.count("worker stopped worker=1"), 1, "{}", logs.contents());

        if first_done {
            second.await;
        } else {
            first.await;
        }
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
        assert_eq!(logs.count("network path scheduler stopped"), 1, "{}", logs.contents());
    }

    #[tokio::test]
    async fn test_abandoned_stop_leaves_scheduler_restartable() {
        let h = harness(enabled_config());
        h.scheduler.start().expect("start");

        let abandoned = tokio::time::timeout(Duration::ZERO, h.scheduler.stop()).await;
        assert!(abandoned.is_err());
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);

        h.scheduler.start().expect("restart");
        assert!(h.scheduler.is_running());
        h.scheduler.stop().await;
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    }

    fn expected_event(dest_ip: &str, hops: [&str; 2]) -> String {
        format!(
            concat!(
                r#"{{"timestamp":0,"namespace":"","path_id":"","#,
                r#""source":{{"hostname":"abc","via":null,"network_id":""}},"#,
                r#""destination":{{"hostname":"abc","ip_address":"{}","port":80}},"#,
                r#""hops":[{{"ttl":0,"ip_address":"{}","hostname":"hop_1","rtt":0,"success":false}},"#,
                r#"{{"ttl":0,"ip_address":"{}","hostname":"hop_2","rtt":0,"success":false}}],"#,
                r#""tags":null}}"#,
            ),
            dest_ip, hops[0], hops[1],
        )
    }

    #[tokio::test]
    async fn test_end_to_end_two_destinations() {
        let h = harness_with(
            NetworkPathConfig {
                flush_interval: Duration::from_millis(300),
                ..enabled_config()
            },
            StubProbe::per_destination(),
            StubForwarder::default(),
            None,
        );
        h.scheduler.start().expect("start");

        h.scheduler.schedule_conns(&[
            outgoing("127.0.0.1", "127.0.0.2", 80),
            outgoing("127.0.0.3", "127.0.0.4", 80),
        ]);

        wait_for(|| h.scheduler.processed_count() == 2).await;
        h.scheduler.stop().await;

        assert_eq!(h.scheduler.received_count(), 2);
        assert_eq!(h.scheduler.processed_count(), 2);

        let tags = [
            "collector:network_path_scheduler",
            "destination_hostname:abc",
            "destination_port:80",
            "protocol:udp",
        ];
        let monitored = h.metrics.gauges_named(crate::metrics::PATH_MONITORED);
        assert_eq!(monitored.len(), 2);
        assert!(monitored
            .iter()
            .all(|call| *call == crate::metrics::MetricCall::new(
                crate::metrics::PATH_MONITORED,
                1.0,
                &tags,
                1.0
            )));

        let events = h.forwarder.events();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|(_, event_type)| *event_type == crate::forwarder::EventType::NetworkPath));

        let mut payloads: Vec<String> = events
            .iter()
            .map(|(payload, _)| String::from_utf8(payload.clone()).expect("utf8"))
            .collect();
        payloads.sort();
        assert_eq!(
            payloads,
            vec![
                expected_event("127.0.0.2", ["1.1.1.1", "1.1.1.2"]),
                expected_event("127.0.0.4", ["1.1.1.3", "1.1.1.4"]),
            ]
        );
    }
}
