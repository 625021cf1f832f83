//! Session counters, reported with the heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters shared by the controller's concurrent callers.
#[derive(Debug, Default)]
pub struct Metrics {
    actions_total: AtomicU64,
    actions_committed: AtomicU64,
    actions_failed: AtomicU64,
    duplicates_refused: AtomicU64,
    snapshots_taken: AtomicU64,
    mutations_proposed: AtomicU64,
    mutations_applied: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub actions_total: u64,
    pub actions_committed: u64,
    pub actions_failed: u64,
    pub duplicates_refused: u64,
    pub snapshots_taken: u64,
    pub mutations_proposed: u64,
    pub mutations_applied: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_committed(&self) {
        self.actions_total.fetch_add(1, Ordering::Relaxed);
        self.actions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.actions_total.fetch_add(1, Ordering::Relaxed);
        self.actions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mutation_proposed(&self) {
        self.mutations_proposed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mutation_applied(&self) {
        self.mutations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            actions_total: self.actions_total.load(Ordering::Relaxed),
            actions_committed: self.actions_committed.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            duplicates_refused: self.duplicates_refused.load(Ordering::Relaxed),
            snapshots_taken: self.snapshots_taken.load(Ordering::Relaxed),
            mutations_proposed: self.mutations_proposed.load(Ordering::Relaxed),
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
        }
    }
}
