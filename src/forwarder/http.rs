use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use prometheus::{Counter, CounterVec, Gauge};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::ForwarderConfig;

use super::{EventType, Forwarder};

/// One queued event.
#[derive(Debug, Clone)]
struct QueuedEvent {
    event_type: EventType,
    payload: Vec<u8>,
}

/// Prometheus handles updated by the forwarder.
#[derive(Clone)]
pub struct ForwarderMetrics {
    pub events_sent: Counter,
    pub batch_errors: CounterVec,
    pub queue_length: Gauge,
}

impl ForwarderMetrics {
    fn batch_error(&self, error_type: &str) {
        self.batch_errors.with_label_values(&[error_type]).inc();
    }
}

/// HTTP NDJSON forwarder with worker pool and compression.
///
/// Events are buffered in a bounded channel; `send_event_blocking` waits for
/// space. A background task groups events into batches, one JSON document
/// per line, optionally compresses them and POSTs them with at most
/// `workers` requests in flight.
pub struct HttpForwarder {
    cfg: ForwarderConfig,
    metrics: Option<ForwarderMetrics>,
    tx: Mutex<Option<mpsc::Sender<QueuedEvent>>>,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HttpForwarder {
    pub fn new(cfg: ForwarderConfig) -> Self {
        Self {
            cfg,
            metrics: None,
            tx: Mutex::new(None),
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Attach Prometheus metrics.
    pub fn with_metrics(mut self, metrics: ForwarderMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the background batching task.
    pub fn start(&self, ctx: CancellationToken) -> Result<()> {
        if self.cfg.max_queue_size == 0 {
            bail!("forwarder max_queue_size must be positive");
        }
        if self.cfg.workers == 0 {
            bail!("forwarder workers must be positive");
        }
        if self.cfg.batch_size == 0 {
            bail!("forwarder batch_size must be positive");
        }
        if self.tx.lock().is_some() {
            bail!("forwarder already started");
        }

        let client = reqwest::Client::builder()
            .timeout(self.cfg.request_timeout)
            .build()
            .context("building HTTP client")?;

        let (tx, rx) = mpsc::channel::<QueuedEvent>(self.cfg.max_queue_size);
        let accumulator = Accumulator {
            cfg: Arc::new(self.cfg.clone()),
            client,
            semaphore: Arc::new(Semaphore::new(self.cfg.workers)),
            metrics: self.metrics.clone(),
            in_flight: JoinSet::new(),
        };

        let handle = tokio::spawn(accumulator.run(rx, ctx.clone()));

        *self.tx.lock() = Some(tx);
        *self.cancel.lock() = Some(ctx);
        *self.handle.lock() = Some(handle);

        tracing::info!(
            address = %self.cfg.address,
            compression = %self.cfg.compression,
            workers = self.cfg.workers,
            "HTTP forwarder started",
        );

        Ok(())
    }

    /// Stop the forwarder, sending everything still queued.
    pub async fn stop(&self) -> Result<()> {
        self.tx.lock().take();

        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await.context("joining HTTP forwarder task")?;
        }

        Ok(())
    }
}

impl Forwarder for HttpForwarder {
    async fn send_event_blocking(&self, payload: Vec<u8>, event_type: EventType) -> Result<()> {
        let Some(tx) = self.tx.lock().clone() else {
            bail!("HTTP forwarder is not running");
        };

        tx.send(QueuedEvent {
            event_type,
            payload,
        })
        .await
        .map_err(|_| anyhow::anyhow!("HTTP forwarder queue closed"))?;

        if let Some(metrics) = &self.metrics {
            let queued = tx.max_capacity() - tx.capacity();
            metrics.queue_length.set(queued as f64);
        }

        Ok(())
    }
}

/// Background state that turns queued events into HTTP requests.
struct Accumulator {
    cfg: Arc<ForwarderConfig>,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    metrics: Option<ForwarderMetrics>,
    in_flight: JoinSet<()>,
}

impl Accumulator {
    async fn run(mut self, mut rx: mpsc::Receiver<QueuedEvent>, ctx: CancellationToken) {
        let batch_size = self.cfg.batch_size;
        let mut batch = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(self.cfg.batch_timeout);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    while let Ok(item) = rx.try_recv() {
                        batch.push(item);
                        if batch.len() >= batch_size {
                            self.dispatch(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)));
                        }
                    }
                    self.dispatch(std::mem::take(&mut batch));
                    break;
                }

                item = rx.recv() => {
                    let Some(item) = item else {
                        self.dispatch(std::mem::take(&mut batch));
                        break;
                    };
                    batch.push(item);

                    while batch.len() < batch_size {
                        match rx.try_recv() {
                            Ok(item) => batch.push(item),
                            Err(_) => break,
                        }
                    }

                    if batch.len() >= batch_size {
                        self.dispatch(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)));
                    }
                }

                _ = interval.tick() => {
                    if !batch.is_empty() {
                        self.dispatch(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)));
                    }
                }

                joined = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Some(Err(e)) = joined {
                        tracing::debug!(error = %e, "HTTP forwarder worker join failed");
                    }
                }
            }
        }

        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::debug!(error = %e, "HTTP forwarder worker join failed");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.queue_length.set(0.0);
        }
    }

    fn dispatch(&mut self, items: Vec<QueuedEvent>) {
        if items.is_empty() {
            return;
        }

        let client = self.client.clone();
        let cfg = Arc::clone(&self.cfg);
        let semaphore = Arc::clone(&self.semaphore);
        let metrics = self.metrics.clone();

        self.in_flight.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(error = %e, "HTTP forwarder semaphore closed");
                    return;
                }
            };

            let count = items.len();
            match send_batch(&client, &cfg, &items).await {
                Ok(()) => {
                    if let Some(m) = &metrics {
                        m.events_sent.inc_by(count as f64);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, events = count, "HTTP forward request failed");
                    if let Some(m) = &metrics {
                        m.batch_error(e.kind());
                    }
                }
            }
        });
    }
}

/// Failure of one batch request.
#[derive(Debug, thiserror::Error)]
enum BatchError {
    #[error("compressing batch: {0:#}")]
    Encode(anyhow::Error),

    #[error("sending HTTP request: {0}")]
    Send(#[from] reqwest::Error),

    #[error("unexpected HTTP status: {0}")]
    Status(reqwest::StatusCode),
}

impl BatchError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Encode(_) => "encode",
            Self::Send(_) => "send",
            Self::Status(_) => "status",
        }
    }
}

/// Sends one batch of events via HTTP.
async fn send_batch(
    client: &reqwest::Client,
    cfg: &ForwarderConfig,
    items: &[QueuedEvent],
) -> Result<(), BatchError> {
    let Some(first) = items.first() else {
        return Ok(());
    };

    let body = encode_ndjson(items);
    let raw_len = body.len();
    let compressed = compress(&body, &cfg.compression).map_err(BatchError::Encode)?;

    let mut request = client
        .post(&cfg.address)
        .header("Content-Type", "application/x-ndjson")
        .header("X-Event-Type", first.event_type.as_str())
        .body(compressed);

    if let Some(encoding) = content_encoding(&cfg.compression) {
        request = request.header("Content-Encoding", encoding);
    }

    for (k, v) in &cfg.headers {
        request = request.header(k.as_str(), v.as_str());
    }

    let resp = request.send().await?;
    let status = resp.status();
    let _ = resp.bytes().await;

    if !status.is_success() {
        return Err(BatchError::Status(status));
    }

    tracing::debug!(events = items.len(), bytes = raw_len, "forwarded batch via HTTP");

    Ok(())
}

/// Joins payloads into newline-delimited JSON.
fn encode_ndjson(items: &[QueuedEvent]) -> Vec<u8> {
    let total: usize = items.iter().map(|e| e.payload.len() + 1).sum();
    let mut buf = Vec::with_capacity(total);
    for item in items {
        buf.extend_from_slice(&item.payload);
        buf.push(b'\n');
    }
    buf
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => zstd::encode_all(data, 0).context("zstd encode"),
        "zlib" => compress_zlib(data),
        "snappy" => snap::raw::Encoder::new()
            .compress_vec(data)
            .context("snappy encode"),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}
