//! Lightweight global metrics for snaprevert.
//!
//! Thread-safe atomic counters, grouped per subsystem:
//! - Snapshot walks
//! - Exception store (export)
//! - Diff image / device replay (revert)
//!
//! Counters are observational only; run state lives in the builder and engine.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Snapshot walks -----
static SNAPSHOTS_WALKED: AtomicU64 = AtomicU64::new(0);
static EXTENTS_DIVERGING: AtomicU64 = AtomicU64::new(0);

// ----- Exception store -----
static EXCEPTIONS_RECORDED: AtomicU64 = AtomicU64::new(0);
static DEDUP_HITS: AtomicU64 = AtomicU64::new(0);
static CHUNKS_FLUSHED: AtomicU64 = AtomicU64::new(0);
static CHUNK_REREADS: AtomicU64 = AtomicU64::new(0);

// ----- Revert -----
static DIFF_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static DEVICE_EXTENTS_REPLAYED: AtomicU64 = AtomicU64::new(0);
static DEVICE_BYTES_REPLAYED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub snapshots_walked: u64,
    pub extents_diverging: u64,

    pub exceptions_recorded: u64,
    pub dedup_hits: u64,
    pub chunks_flushed: u64,
    pub chunk_rereads: u64,

    pub diff_bytes_written: u64,
    pub device_extents_replayed: u64,
    pub device_bytes_replayed: u64,
}

impl MetricsSnapshot {
    /// Share of looked-up blocks that were already captured.
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.exceptions_recorded + self.dedup_hits;
        if total == 0 {
            0.0
        } else {
            self.dedup_hits as f64 / total as f64
        }
    }
}

// ----- Recorders (snapshot walks) -----
pub fn record_snapshot_walked() {
    SNAPSHOTS_WALKED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_extent_diverging() {
    EXTENTS_DIVERGING.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (exception store) -----
pub fn record_exception() {
    EXCEPTIONS_RECORDED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dedup_hit() {
    DEDUP_HITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_chunk_flush() {
    CHUNKS_FLUSHED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_chunk_reread() {
    CHUNK_REREADS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (revert) -----
pub fn record_diff_write(bytes: u64) {
    DIFF_BYTES_WRITTEN.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_device_replay(bytes: u64) {
    DEVICE_EXTENTS_REPLAYED.fetch_add(1, Ordering::Relaxed);
    DEVICE_BYTES_REPLAYED.fetch_add(bytes, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        snapshots_walked: SNAPSHOTS_WALKED.load(Ordering::Relaxed),
        extents_diverging: EXTENTS_DIVERGING.load(Ordering::Relaxed),

        exceptions_recorded: EXCEPTIONS_RECORDED.load(Ordering::Relaxed),
        dedup_hits: DEDUP_HITS.load(Ordering::Relaxed),
        chunks_flushed: CHUNKS_FLUSHED.load(Ordering::Relaxed),
        chunk_rereads: CHUNK_REREADS.load(Ordering::Relaxed),

        diff_bytes_written: DIFF_BYTES_WRITTEN.load(Ordering::Relaxed),
        device_extents_replayed: DEVICE_EXTENTS_REPLAYED.load(Ordering::Relaxed),
        device_bytes_replayed: DEVICE_BYTES_REPLAYED.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    SNAPSHOTS_WALKED.store(0, Ordering::Relaxed);
    EXTENTS_DIVERGING.store(0, Ordering::Relaxed);

    EXCEPTIONS_RECORDED.store(0, Ordering::Relaxed);
    DEDUP_HITS.store(0, Ordering::Relaxed);
    CHUNKS_FLUSHED.store(0, Ordering::Relaxed);
    CHUNK_REREADS.store(0, Ordering::Relaxed);

    DIFF_BYTES_WRITTEN.store(0, Ordering::Relaxed);
    DEVICE_EXTENTS_REPLAYED.store(0, Ordering::Relaxed);
    DEVICE_BYTES_REPLAYED.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_ratio_counts_hits_over_lookups() {
        let m = MetricsSnapshot::default();
        assert_eq!(m.dedup_ratio(), 0.0);

        let m = MetricsSnapshot {
            exceptions_recorded: 6,
            dedup_hits: 2,
            ..MetricsSnapshot::default()
        };
        assert!((m.dedup_ratio() - 0.25).abs() < 1e-12);
    }
}
