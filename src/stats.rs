//! Scheduler statistics.
//!
//! Each core keeps a set of relaxed counters; nothing in the scheduler
//! reads them on a decision path, they exist purely for observability.
//! [`SchedulerStats`] aggregates the per-core counters into a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-core counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub(crate) struct CoreStats {
    works_run: AtomicU64,
    steals: AtomicU64,
    pauses: AtomicU64,
    lifo_enqueues: AtomicU64,
}

impl CoreStats {
    pub(crate) fn work_run(&self) {
        self.works_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lifo(&self) {
        self.lifo_enqueues.fetch_add(1, Ordering::Relaxed);
    }
}

/// Aggregated snapshot of scheduler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Work items executed.
    pub works_run: u64,
    /// Successful steals from another core's queue.
    pub steals: u64,
    /// Times a worker paused for lack of work.
    pub pauses: u64,
    /// LIFO (front-of-queue) enqueues.
    pub lifo_enqueues: u64,
}

impl SchedulerStats {
    pub(crate) fn add(&mut self, core: &CoreStats) {
        self.works_run += core.works_run.load(Ordering::Relaxed);
        self.steals += core.steals.load(Ordering::Relaxed);
        self.pauses += core.pauses.load(Ordering::Relaxed);
        self.lifo_enqueues += core.lifo_enqueues.load(Ordering::Relaxed);
    }
}
