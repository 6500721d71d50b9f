use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::forwarder::{EventForwarder, ForwarderMetrics, HttpForwarder, LogForwarder};
use crate::metrics::PrometheusSender;
use crate::probe::TracerouteProbe;
use crate::sampler::{Sampler, SamplerMetrics};
use crate::scheduler::Scheduler;

/// Scheduler wired to the production collaborators.
pub type AgentScheduler = Scheduler<TracerouteProbe, EventForwarder>;

/// Agent orchestrates all components: health server, forwarder, scheduler
/// and connection sampler.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    forwarder: Arc<EventForwarder>,
    scheduler: Arc<AgentScheduler>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics and the scheduler.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let forwarder = if cfg.forwarder.enabled {
            let metrics = ForwarderMetrics {
                events_sent: health.forwarder_events_sent.clone(),
                batch_errors: health.forwarder_batch_errors.clone(),
                queue_length: health.forwarder_queue_length.clone(),
            };
            EventForwarder::Http(HttpForwarder::new(cfg.forwarder.clone()).with_metrics(metrics))
        } else {
            EventForwarder::Log(LogForwarder::new())
        };
        let forwarder = Arc::new(forwarder);

        let source_hostname = if cfg.traceroute.source_hostname.is_empty() {
            local_hostname()
        } else {
            cfg.traceroute.source_hostname.clone()
        };
        let probe = Arc::new(TracerouteProbe::new(cfg.traceroute.clone(), source_hostname));

        let metrics = Arc::new(PrometheusSender::new(health.registry().clone()));
        let scheduler = Scheduler::new(
            cfg.network_path.clone(),
            probe,
            Arc::clone(&forwarder),
            metrics,
        )
        .context("creating network path scheduler")?;

        Ok(Self {
            cfg,
            health,
            forwarder,
            scheduler: Arc::new(scheduler),
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Shared handle to the scheduler.
    pub fn scheduler(&self) -> Arc<AgentScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Forwarder, before any worker can produce events.
        if let EventForwarder::Http(http) = self.forwarder.as_ref() {
            http.start(CancellationToken::new())
                .context("starting HTTP forwarder")?;
        }
        info!(forwarder = self.forwarder.name(), "forwarder ready");

        // 2. Scheduler.
        self.scheduler
            .start()
            .context("starting network path scheduler")?;

        if !self.scheduler.is_enabled() {
            info!("network path scheduler disabled by configuration");
        }
        self.health
            .scheduler_running
            .set(if self.scheduler.is_running() { 1.0 } else { 0.0 });

        // 3. Background tasks.
        if self.cfg.sampler.enabled && self.scheduler.is_enabled() {
            self.spawn_sampler();
        }
        self.spawn_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop producers before the scheduler so nothing is enqueued late.
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "agent task panicked");
            }
        }

        self.scheduler.stop().await;
        self.health.scheduler_running.set(0.0);

        if let Err(e) = self.forwarder.stop().await {
            error!(error = %e, "error stopping forwarder");
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }

    /// Spawn the procfs connection sampler feeding the scheduler.
    fn spawn_sampler(&mut self) {
        let sampler = Sampler::new(self.cfg.sampler.clone()).with_metrics(SamplerMetrics {
            connections_sampled: self.health.connections_sampled.clone(),
            sampler_errors: self.health.sampler_errors.clone(),
        });
        let scheduler = Arc::clone(&self.scheduler);

        self.tasks.push(tokio::spawn(sampler.run(
            self.cancel.clone(),
            move |conns| scheduler.schedule_conns(conns),
        )));
    }

    /// Spawn background reporter mirroring scheduler counters into health gauges.
    fn spawn_stats_reporter(&mut self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let scheduler = Arc::clone(&self.scheduler);

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let received = scheduler.received_count();
                        let processed = scheduler.processed_count();

                        health.pathtests_received.set(received as f64);
                        health.pathtests_processed.set(processed as f64);

                        debug!(
                            received,
                            processed,
                            store_size = scheduler.store_len(),
                            "scheduler stats",
                        );
                    }
                }
            }
        }));
    }
}

/// Hostname reported as the source of discovered paths.
fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
