pub mod http;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use tracing::debug;

pub use self::http::{ForwarderMetrics, HttpForwarder};

/// Kind of event delivered downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    NetworkPath,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkPath => "network-path",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Downstream sink for serialized events.
///
/// `send_event_blocking` resolves once the event has been accepted, waiting
/// for queue space if the implementation buffers.
pub trait Forwarder: Send + Sync + 'static {
    fn send_event_blocking(
        &self,
        payload: Vec<u8>,
        event_type: EventType,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Forwarder that only logs events. Used when no HTTP endpoint is configured.
#[derive(Debug, Default)]
pub struct LogForwarder {
    events: AtomicU64,
}

impl LogForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events accepted so far.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

impl Forwarder for LogForwarder {
    async fn send_event_blocking(&self, payload: Vec<u8>, event_type: EventType) -> Result<()> {
        self.events.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_type = %event_type,
            bytes = payload.len(),
            payload = %String::from_utf8_lossy(&payload),
            "network path event",
        );
        Ok(())
    }
}

/// Forwarder selected at startup.
pub enum EventForwarder {
    Http(HttpForwarder),
    Log(LogForwarder),
}

impl EventForwarder {
    /// Returns the forwarder name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Http(_) => "http",
            Self::Log(_) => "log",
        }
    }

    /// Stop background delivery, flushing buffered events.
    pub async fn stop(&self) -> Result<()> {
        match self {
            Self::Http(f) => f.stop().await,
            Self::Log(_) => Ok(()),
        }
    }
}

impl Forwarder for EventForwarder {
    async fn send_event_blocking(&self, payload: Vec<u8>, event_type: EventType) -> Result<()> {
        match self {
            Self::Http(f) => f.send_event_blocking(payload, event_type).await,
            Self::Log(f) => f.send_event_blocking(payload, event_type).await,
        }
    }
}
