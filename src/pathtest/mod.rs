pub mod store;

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Probe protocol used to discover a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deduplicated destination scheduled for repeated path discovery.
///
/// Equality and hashing cover the full identity, so two path tests built
/// from different connections to the same remote endpoint collapse into one
/// store entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathTest {
    pub hostname: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl PathTest {
    pub fn new(hostname: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            protocol,
        }
    }

    /// Stable hex identifier for this path test.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hostname.as_bytes());
        hasher.update(b"|");
        hasher.update(self.port.to_be_bytes());
        hasher.update(b"|");
        hasher.update(self.protocol.as_str().as_bytes());
        let digest = hasher.finalize();

        digest
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Display for PathTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.hostname, self.port, self.protocol)
    }
}

/// A path test plus the scheduling metadata the store keeps for it.
///
/// Workers receive clones taken at flush time and never see the store's copy.
#[derive(Debug, Clone)]
pub struct PathTestContext {
    pub path_test: PathTest,
    last_seen: SystemTime,
    last_flush_time: Option<SystemTime>,
    last_flush_interval: Option<Duration>,
}

impl PathTestContext {
    pub fn new(path_test: PathTest, now: SystemTime) -> Self {
        Self {
            path_test,
            last_seen: now,
            last_flush_time: None,
            last_flush_interval: None,
        }
    }

    /// Last time a connection to this destination was observed.
    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    pub fn last_flush_time(&self) -> Option<SystemTime> {
        self.last_flush_time
    }

    /// Interval between the two most recent flushes of this context.
    pub fn last_flush_interval(&self) -> Option<Duration> {
        self.last_flush_interval
    }

    pub fn set_last_flush_interval(&mut self, interval: Duration) {
        self.last_flush_interval = Some(interval);
    }

    fn touch(&mut self, now: SystemTime) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    fn mark_flushed(&mut self, now: SystemTime) {
        if let Some(prev) = self.last_flush_time {
            self.last_flush_interval = Some(now.duration_since(prev).unwrap_or(Duration::ZERO));
        }
        self.last_flush_time = Some(now);
    }

    fn is_expired(&self, now: SystemTime, max_age: Duration) -> bool {
        now.duration_since(self.last_seen)
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_test_identity() {
        let a = PathTest::new("10.0.0.1", 443, Protocol::Udp);
        let b = PathTest::new("10.0.0.1", 443, Protocol::Udp);
        let c = PathTest::new("10.0.0.1", 443, Protocol::Tcp);
        let d = PathTest::new("10.0.0.1", 80, Protocol::Udp);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().len(), 16);
    }

    #[test]
    fn test_path_test_display() {
        let pt = PathTest::new("192.168.1.10", 53, Protocol::Udp);
        assert_eq!(pt.to_string(), "192.168.1.10:53/udp");
    }

    #[test]
    fn test_context_flush_interval_tracking() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut ctx = PathTestContext::new(PathTest::new("h", 1, Protocol::Udp), t0);
        assert!(ctx.last_flush_interval().is_none());

        ctx.mark_flushed(t0);
        assert_eq!(ctx.last_flush_time(), Some(t0));
        assert!(ctx.last_flush_interval().is_none());

        ctx.mark_flushed(t0 + Duration::from_secs(10));
        assert_eq!(ctx.last_flush_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_context_expiry() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let ctx = PathTestContext::new(PathTest::new("h", 1, Protocol::Udp), t0);
        let max_age = Duration::from_secs(60);

        assert!(!ctx.is_expired(t0 + Duration::from_secs(60), max_age));
        assert!(ctx.is_expired(t0 + Duration::from_secs(61), max_age));
        // Clock going backwards never expires an entry.
        assert!(!ctx.is_expired(t0 - Duration::from_secs(5), max_age));
    }
}
