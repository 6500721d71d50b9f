use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pathtest::store::AddOutcome;
use crate::pathtest::PathTest;

use super::queue::Queue;
use super::Shared;

/// Moves path tests from the input queue into the store until cancelled.
pub(super) async fn run_listener<P, F>(
    shared: Arc<Shared<P, F>>,
    input: Queue<PathTest>,
    cancel: CancellationToken,
) {
    info!("listener started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            item = input.recv() => {
                let Some(path_test) = item else { break };
                shared.receive(path_test);
            }
        }
    }

    info!("listener stopped");
}

impl<P, F> Shared<P, F> {
    fn receive(&self, path_test: PathTest) {
        let now = self.now();
        let outcome = self.store.lock().add(path_test.clone(), now);
        self.received.fetch_add(1, Ordering::Relaxed);

        if outcome == AddOutcome::Rejected {
            debug!(
                path_test = %path_test,
                max_size = self.cfg.store.max_size,
                "path test store full, ignoring new destination",
            );
        }
    }
}
