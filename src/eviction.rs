//! Eviction engine.
//!
//! Brings the cache back under its file-count and byte bounds by
//! invalidating the least recently used entries first. The sweep works on a
//! snapshot of the map and removes entries only if they are still the mapped
//! value for their key, so an entry inserted after the snapshot was taken is
//! never destroyed by a stale decision.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::CacheShared;
use crate::entry::CachedContent;

/// Ranking key of one entry, captured once per sweep so the sort sees
/// stable values while readers keep touching entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EvictionRank {
    pub(crate) last_accessed: u64,
    pub(crate) length: u64,
    pub(crate) key: String,
}

impl EvictionRank {
    pub(crate) fn of(content: &CachedContent) -> Self {
        Self {
            last_accessed: content.last_accessed(),
            length: content.content_length(),
            key: content.key().to_string(),
        }
    }
}

/// Oldest first; among equally old entries the smaller one first; then by key.
pub(crate) fn eviction_order(a: &EvictionRank, b: &EvictionRank) -> Ordering {
    a.last_accessed
        .cmp(&b.last_accessed)
        .then(a.length.cmp(&b.length))
        .then_with(|| a.key.cmp(&b.key))
}

/// Evict until both bounds hold or the map is empty.
pub(crate) fn shrink(cache: &CacheShared) {
    while !cache.entries.is_empty() && cache.over_bounds() {
        let mut snapshot: Vec<(EvictionRank, Arc<CachedContent>)> = cache
            .entries
            .iter()
            .map(|entry| (EvictionRank::of(entry.value()), Arc::clone(entry.value())))
            .collect();
        snapshot.sort_by(|(a, _), (b, _)| eviction_order(a, b));

        debug!(
            "shrinking cache: files={} bytes={} candidates={}",
            cache.stats.cached_files(),
            cache.stats.cached_bytes(),
            snapshot.len()
        );

        for (rank, content) in snapshot {
            if !cache.over_bounds() {
                break;
            }
            if cache.remove_if_mapped(&content) {
                content.invalidate();
                cache.stats.record_eviction();
                trace!("evicted {} (last accessed {})", rank.key, rank.last_accessed);
            }
        }
    }
}
