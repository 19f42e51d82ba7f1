//! Statistics and accounting counters for the cache.
//!
//! Two of these counters are not just observability: `cached_files` and
//! `cached_bytes` are the totals the eviction engine enforces its bounds
//! against. Every entry adds itself to `cached_files` when it is built and
//! every buffer it retains adds to `cached_bytes`; invalidation subtracts
//! both again.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters for one cache instance.
///
/// All counters are atomic and can be safely accessed from multiple threads.
/// Use `ContentCache::stats()` to get a snapshot.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered by a valid cached entry.
    hits: AtomicU64,

    /// Lookups that had to go to the resource factory.
    misses: AtomicU64,

    /// Entries removed by the eviction engine.
    evictions: AtomicU64,

    /// Entries invalidated for any reason (eviction, staleness, flush, lost race).
    invalidations: AtomicU64,

    /// Buffers loaded from resources.
    loads: AtomicU64,

    /// Buffer loads that failed.
    load_failures: AtomicU64,

    /// Live entries.
    cached_files: AtomicUsize,

    /// Bytes retained in counted buffers.
    cached_bytes: AtomicU64,
}

impl CacheStats {
    /// Create a new stats instance with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a new entry; returns the new file count.
    pub(crate) fn increment_files(&self) -> usize {
        self.cached_files.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn decrement_files(&self) {
        self.cached_files.fetch_sub(1, Ordering::SeqCst);
    }

    /// Account for a retained buffer; returns the new byte total.
    pub(crate) fn add_bytes(&self, bytes: u64) -> u64 {
        self.cached_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub(crate) fn sub_bytes(&self, bytes: u64) {
        self.cached_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }

    // Getters for reading statistics

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn load_failures(&self) -> u64 {
        self.load_failures.load(Ordering::Relaxed)
    }

    /// Number of live entries.
    pub fn cached_files(&self) -> usize {
        self.cached_files.load(Ordering::SeqCst)
    }

    /// Bytes held in counted (heap and direct) buffers.
    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes.load(Ordering::SeqCst)
    }

    /// Calculate the hit rate as a percentage (0.0 to 100.0).
    /// Returns 0.0 if no lookups have been performed.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }

    /// Create a snapshot of the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            invalidations: self.invalidations(),
            loads: self.loads(),
            load_failures: self.load_failures(),
            cached_files: self.cached_files(),
            cached_bytes: self.cached_bytes(),
            hit_rate: self.hit_rate(),
        }
    }
}

/// A point-in-time snapshot of cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub cached_files: usize,
    pub cached_bytes: u64,
    pub hit_rate: f64,
}
