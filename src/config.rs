use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::pathtest::Protocol;

/// Top-level configuration for the pathwatch agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path scheduler configuration.
    #[serde(default)]
    pub network_path: NetworkPathConfig,

    /// Traceroute probe configuration.
    #[serde(default)]
    pub traceroute: TracerouteConfig,

    /// Event forwarder configuration.
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// Connection sampler configuration.
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Path scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkPathConfig {
    /// Enable connection-driven path discovery. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Number of concurrent probe workers. Default: 4.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the ingestion queue. Default: 1000.
    #[serde(default = "default_queue_size")]
    pub input_queue_size: usize,

    /// Capacity of the flush-to-worker queue. Default: 1000.
    #[serde(default = "default_queue_size")]
    pub processing_queue_size: usize,

    /// Time between flush cycles. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Probe protocol for scheduled path tests. Default: udp.
    #[serde(default)]
    pub protocol: Protocol,

    /// Path test store configuration.
    #[serde(default)]
    pub store: PathTestStoreConfig,
}

/// Path test store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PathTestStoreConfig {
    /// Evict path tests not seen for this long. Default: 10m.
    #[serde(default = "default_store_max_age", with = "humantime_serde")]
    pub max_age: Duration,

    /// Maximum number of stored path tests, 0 for unbounded. Default: 10000.
    #[serde(default = "default_store_max_size")]
    pub max_size: usize,
}

/// Traceroute probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TracerouteConfig {
    /// Path of the traceroute executable. Default: "traceroute".
    #[serde(default = "default_traceroute_binary")]
    pub binary: PathBuf,

    /// Maximum TTL to probe. Default: 30.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u8,

    /// Per-hop wait. Default: 1s.
    #[serde(default = "default_hop_timeout", with = "humantime_serde")]
    pub hop_timeout: Duration,

    /// Source hostname reported in payloads. Default: system hostname.
    #[serde(default)]
    pub source_hostname: String,

    /// Namespace reported in payloads. Default: "default".
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Event forwarder configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    /// Enable the HTTP forwarder. Events are only logged when disabled.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint receiving NDJSON batches.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum events per batch. Default: 100.
    #[serde(default = "default_forwarder_batch_size")]
    pub batch_size: usize,

    /// Maximum wait before sending a partial batch. Default: 5s.
    #[serde(default = "default_forwarder_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Timeout for one HTTP request. Default: 30s.
    #[serde(default = "default_forwarder_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Events buffered before senders block. Default: 1024.
    #[serde(default = "default_forwarder_max_queue_size")]
    pub max_queue_size: usize,

    /// Concurrent HTTP requests. Default: 1.
    #[serde(default = "default_forwarder_workers")]
    pub workers: usize,
}

/// Connection sampler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Enable sampling connections from procfs. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between samples. Default: 30s.
    #[serde(default = "default_sampler_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// procfs mount point. Default: "/proc".
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    1000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_store_max_age() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_store_max_size() -> usize {
    10_000
}

fn default_traceroute_binary() -> PathBuf {
    PathBuf::from("traceroute")
}

fn default_max_ttl() -> u8 {
    30
}

fn default_hop_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_forwarder_batch_size() -> usize {
    100
}

fn default_forwarder_batch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_forwarder_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_forwarder_max_queue_size() -> usize {
    1024
}

fn default_forwarder_workers() -> usize {
    1
}

fn default_sampler_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            network_path: NetworkPathConfig::default(),
            traceroute: TracerouteConfig::default(),
            forwarder: ForwarderConfig::default(),
            sampler: SamplerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for NetworkPathConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: default_workers(),
            input_queue_size: default_queue_size(),
            processing_queue_size: default_queue_size(),
            flush_interval: default_flush_interval(),
            protocol: Protocol::default(),
            store: PathTestStoreConfig::default(),
        }
    }
}

impl Default for PathTestStoreConfig {
    fn default() -> Self {
        Self {
            max_age: default_store_max_age(),
            max_size: default_store_max_size(),
        }
    }
}

impl Default for TracerouteConfig {
    fn default() -> Self {
        Self {
            binary: default_traceroute_binary(),
            max_ttl: default_max_ttl(),
            hop_timeout: default_hop_timeout(),
            source_hostname: String::new(),
            namespace: default_namespace(),
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            batch_size: default_forwarder_batch_size(),
            batch_timeout: default_forwarder_batch_timeout(),
            request_timeout: default_forwarder_request_timeout(),
            max_queue_size: default_forwarder_max_queue_size(),
            workers: default_forwarder_workers(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_sampler_interval(),
            proc_root: default_proc_root(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.network_path
            .validate()
            .context("invalid network_path config")?;

        if self.traceroute.max_ttl == 0 {
            bail!("traceroute.max_ttl must be positive");
        }
        if self.traceroute.hop_timeout.is_zero() {
            bail!("traceroute.hop_timeout must be positive");
        }

        if self.sampler.enabled && self.sampler.interval.is_zero() {
            bail!("sampler.interval must be positive");
        }

        if self.forwarder.enabled {
            if self.forwarder.address.is_empty() {
                bail!("forwarder.address is required when enabled");
            }
            if self.forwarder.max_queue_size == 0 {
                bail!("forwarder.max_queue_size must be positive when enabled");
            }
            if self.forwarder.batch_size == 0 {
                bail!("forwarder.batch_size must be positive when enabled");
            }
            if self.forwarder.workers == 0 {
                bail!("forwarder.workers must be positive when enabled");
            }

            let compression = &self.forwarder.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        Ok(())
    }
}

impl NetworkPathConfig {
    /// Validate numeric scheduler settings.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be positive");
        }
        if self.input_queue_size == 0 {
            bail!("input_queue_size must be positive");
        }
        if self.processing_queue_size == 0 {
            bail!("processing_queue_size must be positive");
        }
        if self.flush_interval.is_zero() {
            bail!("flush_interval must be positive");
        }
        if self.store.max_age.is_zero() {
            bail!("store.max_age must be positive");
        }

        Ok(())
    }
}
