pub mod traceroute;

use std::future::Future;

use anyhow::Result;

use crate::pathtest::Protocol;
use crate::payload::NetworkPath;

pub use self::traceroute::TracerouteProbe;

/// Parameters for a single path-discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub dest_hostname: String,
    pub dest_port: u16,
    pub protocol: Protocol,
}

/// Path-discovery collaborator invoked by scheduler workers.
pub trait Probe: Send + Sync + 'static {
    /// Discover the path to the configured destination.
    fn run(&self, cfg: ProbeConfig) -> impl Future<Output = Result<NetworkPath>> + Send;
}
