use tracing::{error, warn};

use crate::connection::{Connection, Direction, Family};
use crate::forwarder::Forwarder;
use crate::metrics::{PATHTEST_DROPPED, SCHEDULE_DURATION};
use crate::pathtest::PathTest;
use crate::probe::Probe;

use super::{Scheduler, Shared};

const REASON_NO_INPUT_QUEUE: &str = "reason:no_input_queue";
const REASON_INPUT_QUEUE_FULL: &str = "reason:input_queue_full";

impl<P: Probe, F: Forwarder> Scheduler<P, F> {
    /// Register path tests for a batch of observed connections.
    ///
    /// Never blocks and never fails. Only outgoing IPv4 connections are
    /// scheduled; everything that cannot be queued is logged and counted as
    /// dropped.
    pub fn schedule_conns(&self, conns: &[Connection]) {
        self.shared.schedule_conns(conns);
    }
}

impl<P, F> Shared<P, F> {
    pub(super) fn schedule_conns(&self, conns: &[Connection]) {
        let start = self.now();

        if self.input.is_none() {
            error!("no input queue, please check that network path is enabled");
        }

        for conn in conns {
            if conn.direction != Direction::Outgoing || conn.family != Family::V4 {
                continue;
            }

            let path_test = PathTest::new(conn.raddr.ip.clone(), conn.raddr.port, self.cfg.protocol);

            let Some(input) = &self.input else {
                self.drop_path_test(REASON_NO_INPUT_QUEUE);
                continue;
            };

            if let Err(path_test) = input.try_send(path_test) {
                warn!(path_test = %path_test, "scheduler input queue is full");
                self.drop_path_test(REASON_INPUT_QUEUE_FULL);
            }
        }

        let elapsed = self.now().duration_since(start).unwrap_or_default();
        self.metrics
            .gauge(SCHEDULE_DURATION, elapsed.as_secs_f64(), &[], 1.0);
    }

    fn drop_path_test(&self, reason: &str) {
        self.metrics
            .count(PATHTEST_DROPPED, 1.0, &[reason.to_string()], 1.0);
    }
}
