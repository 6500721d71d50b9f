use std::sync::Arc;
use std::time::SystemTime;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::{
    FLUSH_DURATION, FLUSH_INTERVAL, PATHTEST_FLUSHED_COUNT, PATHTEST_STORE_SIZE, WORKERS,
};
use crate::pathtest::store::PathTestStore;

use super::Shared;

/// Hands every stored path test to the workers once per `flush_interval`.
pub(super) async fn run_flush_loop<P, F>(shared: Arc<Shared<P, F>>, cancel: CancellationToken) {
    info!("flush loop started");

    let period = shared.cfg.flush_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_flush: Option<SystemTime> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let start = shared.now();
                shared.flush(&cancel).await;
                shared.flush_wrapper(start, last_flush);
                last_flush = Some(start);
            }
        }
    }

    info!("flush loop stopped");
}

impl<P, F> Shared<P, F> {
    /// Snapshot the store and push every context onto the processing queue.
    ///
    /// Waits for queue space; returns early if `cancel` fires meanwhile.
    pub(super) async fn flush(&self, cancel: &CancellationToken) {
        let Some(processing) = &self.processing else {
            return;
        };

        let now = self.now();
        let (store_size, previous_flush, contexts, released) = {
            let mut store = self.store.lock();
            let size = store.len();
            let previous = store.last_flush_time();

            for expired in store.evict_expired(now) {
                debug!(
                    path_test = %expired.path_test,
                    last_seen = ?expired.last_seen(),
                    last_flush = ?expired.last_flush_time(),
                    "path test expired",
                );
            }

            let contexts = store.flush(now);
            let released = self.release_series(&store);
            (size, previous, contexts, released)
        };

        for tags in &released {
            self.metrics.forget(tags);
        }

        self.metrics
            .gauge(WORKERS, self.cfg.workers as f64, &[], 1.0);
        self.metrics
            .gauge(PATHTEST_STORE_SIZE, store_size as f64, &[], 1.0);
        self.metrics
            .gauge(PATHTEST_FLUSHED_COUNT, contexts.len() as f64, &[], 1.0);

        debug!(
            store_size,
            flushed = contexts.len(),
            released_series = released.len(),
            ?previous_flush,
            "flushing path tests",
        );

        for ctx in contexts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("flush interrupted by shutdown");
                    return;
                }

                result = processing.send(ctx) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Drop recorded telemetry for path tests no longer in `store` and
    /// return the tag sets that no remaining test still uses.
    fn release_series(&self, store: &PathTestStore) -> Vec<Vec<String>> {
        let mut series = self.series.lock();
        let mut released = Vec::new();

        series.retain(|path_test, tags| {
            let live = store.contains(path_test);
            if !live {
                released.push(std::mem::take(tags));
            }
            live
        });
        released.retain(|tags| !series.values().any(|live| live == tags));
        released.dedup();

        released
    }

    /// Emit flush timing. `flush_interval` is only reported once a previous
    /// flush exists.
    pub(super) fn flush_wrapper(&self, start: SystemTime, last_flush: Option<SystemTime>) {
        let duration = self.now().duration_since(start).unwrap_or_default();
        self.metrics
            .gauge(FLUSH_DURATION, duration.as_secs_f64(), &[], 1.0);

        if let Some(last) = last_flush {
            let interval = start.duration_since(last).unwrap_or_default();
            self.metrics
                .gauge(FLUSH_INTERVAL, interval.as_secs_f64(), &[], 1.0);
        }
    }
}
