use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::config::PathTestStoreConfig;

use super::{PathTest, PathTestContext};

/// Result of registering a path test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new identity was stored.
    Inserted,
    /// The identity was already present; its last-seen time was refreshed.
    Refreshed,
    /// The store is at `max_size` and the identity was not present.
    Rejected,
}

/// Deduplicating store of path tests with TTL eviction.
///
/// Not internally synchronized. The scheduler keeps it behind a mutex that
/// only the listener (`add`) and the flush loop (`flush`, `len`) ever lock,
/// and never across an await point.
#[derive(Debug)]
pub struct PathTestStore {
    contexts: HashMap<PathTest, PathTestContext>,
    max_age: Duration,
    max_size: usize,
    last_flush_time: Option<SystemTime>,
}

impl PathTestStore {
    pub fn new(cfg: &PathTestStoreConfig) -> Self {
        Self {
            contexts: HashMap::new(),
            max_age: cfg.max_age,
            max_size: cfg.max_size,
            last_flush_time: None,
        }
    }

    /// Insert a path test, or refresh it if already present.
    pub fn add(&mut self, path_test: PathTest, now: SystemTime) -> AddOutcome {
        if let Some(ctx) = self.contexts.get_mut(&path_test) {
            ctx.touch(now);
            return AddOutcome::Refreshed;
        }

        if self.max_size > 0 && self.contexts.len() >= self.max_size {
            return AddOutcome::Rejected;
        }

        let ctx = PathTestContext::new(path_test.clone(), now);
        self.contexts.insert(path_test, ctx);
        AddOutcome::Inserted
    }

    pub fn contains(&self, path_test: &PathTest) -> bool {
        self.contexts.contains_key(path_test)
    }

    /// Remove entries not seen within `max_age` and return them.
    pub fn evict_expired(&mut self, now: SystemTime) -> Vec<PathTestContext> {
        let max_age = self.max_age;
        let expired: Vec<PathTest> = self
            .contexts
            .iter()
            .filter(|(_, ctx)| ctx.is_expired(now, max_age))
            .map(|(path_test, _)| path_test.clone())
            .collect();

        expired
            .iter()
            .filter_map(|path_test| self.contexts.remove(path_test))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Time of the most recent `flush`, if any.
    pub fn last_flush_time(&self) -> Option<SystemTime> {
        self.last_flush_time
    }

    /// Evict expired entries and return a snapshot of every remaining context.
    ///
    /// Each returned context has `now` recorded as its flush time, and its
    /// flush interval updated from the previous flush.
    pub fn flush(&mut self, now: SystemTime) -> Vec<PathTestContext> {
        self.evict_expired(now);

        let mut flushed = Vec::with_capacity(self.contexts.len());
        for ctx in self.contexts.values_mut() {
            ctx.mark_flushed(now);
            flushed.push(ctx.clone());
        }

        self.last_flush_time = Some(now);
        flushed
    }
}
