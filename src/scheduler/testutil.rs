//! Shared fixtures for scheduler tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::NetworkPathConfig;
use crate::connection::{Addr, Connection};
use crate::forwarder::{EventType, Forwarder};
use crate::metrics::RecordingSender;
use crate::payload::{NetworkPath, NetworkPathDestination, NetworkPathHop, NetworkPathSource};
use crate::probe::{Probe, ProbeConfig};

use super::{Scheduler, TimeFn};

/// In-memory log sink for a scoped `fmt` subscriber.
#[derive(Clone, Default)]
pub(crate) struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub(crate) fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Installs a thread-local subscriber writing into a [`LogBuffer`].
///
/// Tasks spawned on a current-thread runtime inherit it.
pub(crate) fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buf = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buf.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buf, guard)
}

type ProbeFn = dyn Fn(&ProbeConfig) -> Result<NetworkPath> + Send + Sync;

/// Probe returning canned paths.
pub(crate) struct StubProbe {
    run_fn: Box<ProbeFn>,
    calls: AtomicUsize,
}

impl StubProbe {
    pub(crate) fn new(f: impl Fn(&ProbeConfig) -> Result<NetworkPath> + Send + Sync + 'static) -> Self {
        Self {
            run_fn: Box::new(f),
            calls: AtomicUsize::new(0),
        }
    }

    /// Probe that returns a two-hop path to the requested destination.
    pub(crate) fn two_hops() -> Self {
        Self::new(|cfg| Ok(two_hop_path(&cfg.dest_hostname, cfg.dest_port)))
    }

    /// Probe answering with distinct hops per destination, matching
    /// `127.0.0.2` and `127.0.0.4`.
    pub(crate) fn per_destination() -> Self {
        Self::new(|cfg| match cfg.dest_hostname.as_str() {
            "127.0.0.2" => Ok(path_via("127.0.0.2", cfg.dest_port, ["1.1.1.1", "1.1.1.2"])),
            "127.0.0.4" => Ok(path_via("127.0.0.4", cfg.dest_port, ["1.1.1.3", "1.1.1.4"])),
            other => bail!("unexpected destination {other}"),
        })
    }

    pub(crate) fn failing() -> Self {
        Self::new(|cfg| bail!("no route to {}", cfg.dest_hostname))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Probe for StubProbe {
    async fn run(&self, cfg: ProbeConfig) -> Result<NetworkPath> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.run_fn)(&cfg)
    }
}

/// Forwarder recording every event.
#[derive(Default)]
pub(crate) struct StubForwarder {
    events: Mutex<Vec<(Vec<u8>, EventType)>>,
    fail: bool,
}

impl StubForwarder {
    pub(crate) fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) fn events(&self) -> Vec<(Vec<u8>, EventType)> {
        self.events.lock().clone()
    }
}

impl Forwarder for StubForwarder {
    async fn send_event_blocking(&self, payload: Vec<u8>, event_type: EventType) -> Result<()> {
        if self.fail {
            bail!("forwarder unavailable");
        }
        self.events.lock().push((payload, event_type));
        Ok(())
    }
}

pub(crate) fn two_hop_path(dest_ip: &str, port: u16) -> NetworkPath {
    path_via(dest_ip, port, ["1.1.1.1", "1.1.1.2"])
}

/// Path to `dest_ip` through the two given hop addresses.
pub(crate) fn path_via(dest_ip: &str, port: u16, hops: [&str; 2]) -> NetworkPath {
    NetworkPath {
        source: NetworkPathSource {
            hostname: "abc".to_string(),
            ..Default::default()
        },
        destination: NetworkPathDestination {
            hostname: "abc".to_string(),
            ip_address: dest_ip.to_string(),
            port,
        },
        hops: vec![
            NetworkPathHop {
                hostname: "hop_1".to_string(),
                ip_address: hops[0].to_string(),
                ..Default::default()
            },
            NetworkPathHop {
                hostname: "hop_2".to_string(),
                ip_address: hops[1].to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

pub(crate) fn outgoing(local: &str, remote: &str, port: u16) -> Connection {
    Connection::outgoing(Addr::new(local, 30000), Addr::new(remote, port))
}

pub(crate) fn enabled_config() -> NetworkPathConfig {
    NetworkPathConfig {
        enabled: true,
        ..Default::default()
    }
}

/// Fixed reference time used by clock-driven tests.
pub(crate) fn mock_now() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_704_067_200)
}

pub(crate) fn fixed_clock(t: SystemTime) -> TimeFn {
    Arc::new(move || t)
}

pub(crate) type TestScheduler = Scheduler<StubProbe, StubForwarder>;

pub(crate) struct Harness {
    pub(crate) scheduler: TestScheduler,
    pub(crate) probe: Arc<StubProbe>,
    pub(crate) forwarder: Arc<StubForwarder>,
    pub(crate) metrics: Arc<RecordingSender>,
}

pub(crate) fn harness(cfg: NetworkPathConfig) -> Harness {
    harness_with(cfg, StubProbe::two_hops(), StubForwarder::default(), None)
}

pub(crate) fn harness_with(
    cfg: NetworkPathConfig,
    probe: StubProbe,
    forwarder: StubForwarder,
    clock: Option<TimeFn>,
) -> Harness {
    let probe = Arc::new(probe);
    let forwarder = Arc::new(forwarder);
    let metrics = Arc::new(RecordingSender::new());
    let clock = clock.unwrap_or_else(|| Arc::new(SystemTime::now));

    let scheduler = Scheduler::with_clock(
        cfg,
        Arc::clone(&probe),
        Arc::clone(&forwarder),
        metrics.clone(),
        clock,
    )
    .expect("valid scheduler config");

    Harness {
        scheduler,
        probe,
        forwarder,
        metrics,
    }
}

/// Polls `cond` until it holds, failing after five seconds.
pub(crate) async fn wait_for(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
