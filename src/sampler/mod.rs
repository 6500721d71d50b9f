//! Connection sampler reading the kernel TCP tables.
//!
//! Each sample parses `<proc_root>/net/tcp` and `<proc_root>/net/tcp6`,
//! infers the direction of every established socket from the set of
//! listening ports and hands the batch to a callback.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::Result;
use prometheus::Counter;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SamplerConfig;
use crate::connection::{Addr, Connection, ConnectionType, Direction, Family};

const TCP_ESTABLISHED: u8 = 0x01;
const TCP_LISTEN: u8 = 0x0A;

/// Errors that can occur while parsing a `/proc/net/tcp` table.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: expected at least 4 fields")]
    TooFewFields { line: usize },

    #[error("line {line}: invalid address {raw:?}")]
    InvalidAddress { line: usize, raw: String },

    #[error("line {line}: invalid state {raw:?}")]
    InvalidState { line: usize, raw: String },
}

/// One socket row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRow {
    pub local: Addr,
    pub remote: Addr,
    pub state: u8,
    pub family: Family,
}

/// Parse the contents of `/proc/net/tcp` (V4) or `/proc/net/tcp6` (V6).
pub fn parse_tcp_table(content: &str, family: Family) -> Result<Vec<TcpRow>, ParseError> {
    let mut rows = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let mut fields = line.split_whitespace();

        let Some(slot) = fields.next() else {
            continue;
        };
        if slot == "sl" {
            continue;
        }

        let (Some(local_raw), Some(remote_raw), Some(state_raw)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(ParseError::TooFewFields { line: line_no });
        };

        let local = parse_addr(local_raw, family).ok_or_else(|| ParseError::InvalidAddress {
            line: line_no,
            raw: local_raw.to_string(),
        })?;
        let remote = parse_addr(remote_raw, family).ok_or_else(|| ParseError::InvalidAddress {
            line: line_no,
            raw: remote_raw.to_string(),
        })?;
        let state = u8::from_str_radix(state_raw, 16).map_err(|_| ParseError::InvalidState {
            line: line_no,
            raw: state_raw.to_string(),
        })?;

        rows.push(TcpRow {
            local,
            remote,
            state,
            family,
        });
    }

    Ok(rows)
}

/// Decodes `0100007F:0050` style addresses.
///
/// The kernel prints each 32-bit word of the address in host byte order and
/// the port in big-endian hex.
fn parse_addr(raw: &str, family: Family) -> Option<Addr> {
    let (ip_hex, port_hex) = raw.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match family {
        Family::V4 => {
            if ip_hex.len() != 8 {
                return None;
            }
            let word = u32::from_str_radix(ip_hex, 16).ok()?;
            Ipv4Addr::from(word.to_le_bytes()).to_string()
        }
        Family::V6 => {
            if ip_hex.len() != 32 {
                return None;
            }
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(ip_hex.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            Ipv6Addr::from(octets).to_string()
        }
    };

    Some(Addr::new(ip, port))
}

/// Turns established sockets into connections.
///
/// A socket whose local port has a listener is incoming; every other
/// established socket is outgoing.
pub fn classify(rows: &[TcpRow]) -> Vec<Connection> {
    let listening: HashSet<u16> = rows
        .iter()
        .filter(|r| r.state == TCP_LISTEN)
        .map(|r| r.local.port)
        .collect();

    rows.iter()
        .filter(|r| r.state == TCP_ESTABLISHED)
        .map(|r| Connection {
            laddr: r.local.clone(),
            raddr: r.remote.clone(),
            direction: if listening.contains(&r.local.port) {
                Direction::Incoming
            } else {
                Direction::Outgoing
            },
            family: r.family,
            conn_type: ConnectionType::Tcp,
        })
        .collect()
}

/// Read and classify every TCP socket under `proc_root`.
#[cfg(target_os = "linux")]
pub fn read_connections(proc_root: &Path) -> Result<Vec<Connection>> {
    use anyhow::Context;

    let mut rows = Vec::new();

    for (file, family) in [("net/tcp", Family::V4), ("net/tcp6", Family::V6)] {
        let path = proc_root.join(file);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            // tcp6 is absent when IPv6 is disabled.
            Err(e) if family == Family::V6 && e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "skipping missing table");
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        rows.extend(
            parse_tcp_table(&content, family)
                .with_context(|| format!("parsing {}", path.display()))?,
        );
    }

    Ok(classify(&rows))
}

#[cfg(not(target_os = "linux"))]
pub fn read_connections(_proc_root: &Path) -> Result<Vec<Connection>> {
    anyhow::bail!("connection sampling requires Linux procfs")
}

/// Prometheus counters updated by the sampler.
#[derive(Clone)]
pub struct SamplerMetrics {
    pub connections_sampled: Counter,
    pub sampler_errors: Counter,
}

/// Periodic connection sampler.
pub struct Sampler {
    cfg: SamplerConfig,
    metrics: Option<SamplerMetrics>,
}

impl Sampler {
    pub fn new(cfg: SamplerConfig) -> Self {
        Self { cfg, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: SamplerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Take one sample.
    pub fn sample(&self) -> Result<Vec<Connection>> {
        let result = read_connections(&self.cfg.proc_root);

        if let Some(m) = &self.metrics {
            match &result {
                Ok(conns) => m.connections_sampled.inc_by(conns.len() as f64),
                Err(_) => m.sampler_errors.inc(),
            }
        }

        result
    }

    /// Sample every `interval` until cancelled, passing each batch to `sink`.
    ///
    /// The first sample is taken immediately.
    pub async fn run<S>(self, cancel: CancellationToken, sink: S)
    where
        S: Fn(&[Connection]) + Send + 'static,
    {
        info!(
            interval = ?self.cfg.interval,
            proc_root = %self.cfg.proc_root.display(),
            "connection sampler started",
        );

        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    match self.sample() {
                        Ok(conns) => {
                            debug!(connections = conns.len(), "sampled connections");
                            sink(&conns);
                        }
                        Err(e) => {
                            warn!(error = %format!("{e:#}"), "sampling connections");
                        }
                    }
                }
            }
        }

        info!("connection sampler stopped");
    }
}
