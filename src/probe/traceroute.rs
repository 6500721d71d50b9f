//! Probe backed by the system `traceroute` executable.
//!
//! Runs one query per hop in numeric mode and converts the textual report
//! into a [`NetworkPath`].

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::TracerouteConfig;
use crate::pathtest::{PathTest, Protocol};
use crate::payload::{NetworkPath, NetworkPathDestination, NetworkPathHop, NetworkPathSource};

use super::{Probe, ProbeConfig};

/// Errors that can occur while parsing traceroute output.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty traceroute output")]
    Empty,

    #[error("line {line}: invalid hop number {raw:?}")]
    InvalidTtl { line: usize, raw: String },

    #[error("line {line}: invalid round-trip time {raw:?}")]
    InvalidRtt { line: usize, raw: String },

    #[error("line {line}: missing round-trip time")]
    MissingRtt { line: usize },
}

/// Parsed traceroute report.
#[derive(Debug, Clone, PartialEq)]
pub struct TracerouteReport {
    /// Destination address from the header line, if printed.
    pub dest_ip: Option<String>,
    pub hops: Vec<NetworkPathHop>,
}

/// Path-discovery probe that shells out to `traceroute`.
pub struct TracerouteProbe {
    cfg: TracerouteConfig,
    source_hostname: String,
}

impl TracerouteProbe {
    pub fn new(cfg: TracerouteConfig, source_hostname: String) -> Self {
        Self {
            cfg,
            source_hostname,
        }
    }

    /// Command-line arguments for one run.
    fn args(&self, probe: &ProbeConfig) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            "-q".to_string(),
            "1".to_string(),
            "-m".to_string(),
            self.cfg.max_ttl.to_string(),
            "-w".to_string(),
            format!("{:.1}", self.cfg.hop_timeout.as_secs_f64()),
        ];

        match probe.protocol {
            Protocol::Udp => args.push("-U".to_string()),
            Protocol::Tcp => args.push("-T".to_string()),
        }

        if probe.dest_port != 0 {
            args.push("-p".to_string());
            args.push(probe.dest_port.to_string());
        }

        args.push(probe.dest_hostname.clone());
        args
    }

    fn build_path(&self, probe: &ProbeConfig, report: TracerouteReport) -> NetworkPath {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let key = PathTest::new(probe.dest_hostname.clone(), probe.dest_port, probe.protocol).key();

        NetworkPath {
            timestamp,
            namespace: self.cfg.namespace.clone(),
            path_id: format!("{key}-{timestamp}"),
            source: NetworkPathSource {
                hostname: self.source_hostname.clone(),
                via: None,
                network_id: String::new(),
            },
            destination: NetworkPathDestination {
                hostname: probe.dest_hostname.clone(),
                ip_address: report
                    .dest_ip
                    .unwrap_or_else(|| probe.dest_hostname.clone()),
                port: probe.dest_port,
            },
            hops: report.hops,
            tags: None,
        }
    }
}

impl Probe for TracerouteProbe {
    async fn run(&self, cfg: ProbeConfig) -> Result<NetworkPath> {
        let args = self.args(&cfg);
        debug!(binary = %self.cfg.binary.display(), ?args, "running traceroute");

        let output = Command::new(&self.cfg.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.cfg.binary.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "traceroute to {} exited with {}: {}",
                cfg.dest_hostname,
                output.status,
                stderr.trim()
            );
        }

        let report = parse_output(&stdout)
            .with_context(|| format!("parsing traceroute output for {}", cfg.dest_hostname))?;

        Ok(self.build_path(&cfg, report))
    }
}

/// Parse `traceroute -q 1` output.
///
/// Accepts both numeric (`3  10.0.0.1  5.1 ms`) and resolved
/// (`3  gw.lan (10.0.0.1)  5.1 ms`) hop lines. A `*` hop is recorded as
/// unsuccessful with empty address.
pub fn parse_output(output: &str) -> Result<TracerouteReport, ParseError> {
    let mut dest_ip = None;
    let mut hops = Vec::new();

    for (idx, raw_line) in output.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("traceroute") {
            dest_ip = parse_header(line);
            continue;
        }

        let mut tokens = line.split_whitespace();
        let Some(ttl_raw) = tokens.next() else {
            continue;
        };
        let ttl: u8 = ttl_raw.parse().map_err(|_| ParseError::InvalidTtl {
            line: line_no,
            raw: ttl_raw.to_string(),
        })?;

        let rest: Vec<&str> = tokens.collect();
        let Some(first) = rest.first() else {
            return Err(ParseError::MissingRtt { line: line_no });
        };

        if *first == "*" {
            hops.push(NetworkPathHop {
                ttl,
                ..Default::default()
            });
            continue;
        }

        let (hostname, ip, rtt_idx) = match rest.get(1) {
            Some(next) if next.starts_with('(') => {
                let ip = next.trim_start_matches('(').trim_end_matches(')');
                (first.to_string(), ip.to_string(), 2)
            }
            _ => (first.to_string(), first.to_string(), 1),
        };

        let rtt_raw = rest
            .get(rtt_idx)
            .ok_or(ParseError::MissingRtt { line: line_no })?;
        let rtt: f64 = rtt_raw.parse().map_err(|_| ParseError::InvalidRtt {
            line: line_no,
            raw: rtt_raw.to_string(),
        })?;

        hops.push(NetworkPathHop {
            ttl,
            ip_address: ip,
            hostname,
            rtt,
            success: true,
        });
    }

    if dest_ip.is_none() && hops.is_empty() {
        return Err(ParseError::Empty);
    }

    Ok(TracerouteReport { dest_ip, hops })
}

/// Extracts the address from `traceroute to host (1.2.3.4), 30 hops max, ...`.
fn parse_header(line: &str) -> Option<String> {
    let start = line.find('(')?;
    let end = line[start..].find(')')? + start;
    Some(line[start + 1..end].to_string())
}
