use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health, plus the HTTP server exposing them.
///
/// Scheduler telemetry is registered into the same registry by
/// [`crate::metrics::PrometheusSender`].
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Whether the path scheduler is running (1=yes, 0=no).
    pub scheduler_running: Gauge,
    /// Connection records read by the sampler.
    pub connections_sampled: Counter,
    /// Sampler failures reading procfs.
    pub sampler_errors: Counter,
    /// Path tests received by the scheduler listener.
    pub pathtests_received: Gauge,
    /// Probe runs completed by workers.
    pub pathtests_processed: Gauge,
    /// Events successfully delivered by the HTTP forwarder.
    pub forwarder_events_sent: Counter,
    /// Forwarder batch errors by error_type.
    pub forwarder_batch_errors: CounterVec,
    /// Events waiting in the forwarder queue.
    pub forwarder_queue_length: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let scheduler_running = Gauge::with_opts(
            Opts::new(
                "scheduler_running",
                "Whether the path scheduler is running (1=yes, 0=no).",
            )
            .namespace("pathwatch"),
        )?;
        let connections_sampled = Counter::with_opts(
            Opts::new(
                "connections_sampled_total",
                "Total connection records read by the sampler.",
            )
            .namespace("pathwatch"),
        )?;
        let sampler_errors = Counter::with_opts(
            Opts::new(
                "sampler_errors_total",
                "Total sampler failures reading procfs.",
            )
            .namespace("pathwatch"),
        )?;
        let pathtests_received = Gauge::with_opts(
            Opts::new(
                "pathtests_received",
                "Path tests received by the scheduler listener.",
            )
            .namespace("pathwatch"),
        )?;
        let pathtests_processed = Gauge::with_opts(
            Opts::new(
                "pathtests_processed",
                "Probe runs completed by scheduler workers.",
            )
            .namespace("pathwatch"),
        )?;
        let forwarder_events_sent = Counter::with_opts(
            Opts::new(
                "forwarder_events_sent_total",
                "Total network path events delivered by the forwarder.",
            )
            .namespace("pathwatch"),
        )?;
        let forwarder_batch_errors = CounterVec::new(
            Opts::new(
                "forwarder_batch_errors_total",
                "Total forwarder batch errors by error type.",
            )
            .namespace("pathwatch"),
            &["error_type"],
        )?;
        let forwarder_queue_length = Gauge::with_opts(
            Opts::new(
                "forwarder_queue_length",
                "Events waiting in the forwarder queue.",
            )
            .namespace("pathwatch"),
        )?;

        registry.register(Box::new(scheduler_running.clone()))?;
        registry.register(Box::new(connections_sampled.clone()))?;
        registry.register(Box::new(sampler_errors.clone()))?;
        registry.register(Box::new(pathtests_received.clone()))?;
        registry.register(Box::new(pathtests_processed.clone()))?;
        registry.register(Box::new(forwarder_events_sent.clone()))?;
        registry.register(Box::new(forwarder_batch_errors.clone()))?;
        registry.register(Box::new(forwarder_queue_length.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            scheduler_running,
            connections_sampled,
            sampler_errors,
            pathtests_received,
            pathtests_processed,
            forwarder_events_sent,
            forwarder_batch_errors,
            forwarder_queue_length,
        })
    }

    /// Registry shared with other metric producers.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to a wildcard bind address.
fn bind_address(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
