//! Read-cache operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for read-cache operations. All relaxed; these feed reporting,
/// never control flow.
#[derive(Default)]
pub struct ReadCacheStats {
    read_calls: AtomicU64,
    read_hits: AtomicU64,
    insert_calls: AtomicU64,
    insert_success: AtomicU64,
    insert_abandoned: AtomicU64,
    evicted_records: AtomicU64,
    evicted_invalid: AtomicU64,
    lock_transfers: AtomicU64,
}

impl ReadCacheStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self) {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.read_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self) {
        self.insert_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert_success(&self) {
        self.insert_success.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert_abandoned(&self) {
        self.insert_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, count: u64, invalid_count: u64) {
        self.evicted_records.fetch_add(count, Ordering::Relaxed);
        self.evicted_invalid
            .fetch_add(invalid_count, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_transfer(&self) {
        self.lock_transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of lookups.
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    /// Number of lookups that hit the cache.
    pub fn read_hits(&self) -> u64 {
        self.read_hits.load(Ordering::Relaxed)
    }

    /// Hit rate in [0.0, 1.0].
    pub fn hit_rate(&self) -> f64 {
        let calls = self.read_calls();
        if calls == 0 {
            return 0.0;
        }
        self.read_hits() as f64 / calls as f64
    }

    /// Number of insert attempts.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::Relaxed)
    }

    /// Number of inserts that stayed in the chain.
    pub fn insert_success(&self) -> u64 {
        self.insert_success.load(Ordering::Relaxed)
    }

    /// Number of inserts abandoned after losing a race.
    pub fn insert_abandoned(&self) -> u64 {
        self.insert_abandoned.load(Ordering::Relaxed)
    }

    /// Number of records retired by eviction.
    pub fn evicted_records(&self) -> u64 {
        self.evicted_records.load(Ordering::Relaxed)
    }

    /// Number of shared-lock transfers onto replacing records.
    pub fn lock_transfers(&self) -> u64 {
        self.lock_transfers.load(Ordering::Relaxed)
    }

    /// Snapshot of all counters.
    pub fn summary(&self) -> ReadCacheStatsSummary {
        ReadCacheStatsSummary {
            read_calls: self.read_calls(),
            read_hits: self.read_hits(),
            hit_rate: self.hit_rate(),
            insert_calls: self.insert_calls(),
            insert_success: self.insert_success(),
            insert_abandoned: self.insert_abandoned(),
            evicted_records: self.evicted_records(),
            evicted_invalid: self.evicted_invalid.load(Ordering::Relaxed),
            lock_transfers: self.lock_transfers(),
        }
    }
}

/// Point-in-time snapshot of [`ReadCacheStats`].
#[derive(Debug, Clone)]
pub struct ReadCacheStatsSummary {
    /// Number of lookups.
    pub read_calls: u64,
    /// Number of cache hits.
    pub read_hits: u64,
    /// Hit rate.
    pub hit_rate: f64,
    /// Number of insert attempts.
    pub insert_calls: u64,
    /// Number of inserts that stayed in the chain.
    pub insert_success: u64,
    /// Number of abandoned inserts.
    pub insert_abandoned: u64,
    /// Number of records retired by eviction.
    pub evicted_records: u64,
    /// Of those, how many were already invalid.
    pub evicted_invalid: u64,
    /// Number of shared-lock transfers.
    pub lock_transfers: u64,
}
