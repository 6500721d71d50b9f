use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::forwarder::{EventType, Forwarder};
use crate::metrics::{CHECK_DURATION, CHECK_INTERVAL, PATH_MONITORED};
use crate::pathtest::PathTestContext;
use crate::payload::NetworkPath;
use crate::probe::{Probe, ProbeConfig};

use super::Shared;

const COLLECTOR_TAG: &str = "collector:network_path_scheduler";

/// Probes path tests from the processing queue until cancelled.
pub(super) async fn run_worker<P: Probe, F: Forwarder>(
    shared: Arc<Shared<P, F>>,
    id: usize,
    cancel: CancellationToken,
) {
    info!(worker = id, "worker started");

    let Some(processing) = shared.processing.clone() else {
        info!(worker = id, "worker stopped");
        return;
    };

    loop {
        let ctx = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            item = processing.recv() => match item {
                Some(ctx) => ctx,
                None => break,
            },
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(worker = id, "path test interrupted by shutdown");
                break;
            }

            _ = shared.run_path_test(ctx, id) => {}
        }
    }

    info!(worker = id, "worker stopped");
}

impl<P: Probe, F: Forwarder> Shared<P, F> {
    /// Run one probe and forward its result.
    async fn run_path_test(&self, ctx: PathTestContext, worker: usize) {
        let check_start = self.now();
        let cfg = ProbeConfig {
            dest_hostname: ctx.path_test.hostname.clone(),
            dest_port: ctx.path_test.port,
            protocol: ctx.path_test.protocol,
        };

        match self.probe.run(cfg).await {
            Ok(path) => {
                self.send_telemetry(&path, check_start, &ctx);
                self.forward(&path, &ctx, worker).await;
            }
            Err(e) => {
                warn!(
                    worker,
                    path_test = %ctx.path_test,
                    error = %format!("{e:#}"),
                    "path probe failed",
                );
            }
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn forward(&self, path: &NetworkPath, ctx: &PathTestContext, worker: usize) {
        let payload = match path.to_compact_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(worker, path_test = %ctx.path_test, error = %e, "encoding network path");
                return;
            }
        };

        if let Err(e) = self
            .forwarder
            .send_event_blocking(payload, EventType::NetworkPath)
            .await
        {
            error!(
                worker,
                path_test = %ctx.path_test,
                error = %format!("{e:#}"),
                "forwarding network path",
            );
        }
    }
}

impl<P, F> Shared<P, F> {
    /// Emit per-test gauges for a completed probe.
    pub(super) fn send_telemetry(
        &self,
        path: &NetworkPath,
        check_start: SystemTime,
        ctx: &PathTestContext,
    ) {
        let tags = vec![
            COLLECTOR_TAG.to_string(),
            format!("destination_hostname:{}", path.destination.hostname),
            format!("destination_port:{}", path.destination.port),
            format!("protocol:{}", ctx.path_test.protocol),
        ];

        self.metrics.gauge(PATH_MONITORED, 1.0, &tags, 1.0);

        let duration = self.now().duration_since(check_start).unwrap_or_default();
        self.metrics
            .gauge(CHECK_DURATION, duration.as_secs_f64(), &tags, 1.0);

        if let Some(interval) = ctx.last_flush_interval() {
            self.metrics
                .gauge(CHECK_INTERVAL, interval.as_secs_f64(), &tags, 1.0);
        }

        self.series.lock().insert(ctx.path_test.clone(), tags);
    }
}
