use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by the gateway, the accumulator and the HTTP API.
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    flushed_batches: AtomicU64,
    flushed_records: AtomicU64,
    failed_batches: AtomicU64,
    dropped_records: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub flushed_batches: u64,
    pub flushed_records: u64,
    pub failed_batches: u64,
    pub dropped_records: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, records: usize) {
        self.flushed_batches.fetch_add(1, Ordering::Relaxed);
        self.flushed_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_failed_flush(&self, records: usize) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        self.dropped_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    /// Accepted records that were still queued when the worker stopped.
    pub fn record_abandoned(&self, records: usize) {
        self.dropped_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flushed_batches: self.flushed_batches.load(Ordering::Relaxed),
            flushed_records: self.flushed_records.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
        }
    }
}
