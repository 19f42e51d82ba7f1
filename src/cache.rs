//! The content cache.
//!
//! [`ContentCache`] maps request paths to [`CachedContent`] entries, loading
//! resources on a miss and deciding whether they are worth holding. Entries
//! that cannot be held are still served, as uncached [`ResourceContent`].

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::content::{HttpContent, ResourceContent};
use crate::entry::CachedContent;
use crate::error::CacheResult;
use crate::eviction;
use crate::headers;
use crate::precompressed::CompressedContentFormat;
use crate::resource::{Resource, ResourceFactory, ResourceMetadata};
use crate::stats::{CacheStats, StatsSnapshot};

/// State shared between a cache handle and its entries.
///
/// Entries hold a weak reference to this so they can update the counters,
/// remove themselves when stale and trigger eviction.
pub(crate) struct CacheShared {
    pub(crate) entries: DashMap<String, Arc<CachedContent>>,
    pub(crate) stats: CacheStats,
    max_cached_file_size: AtomicU64,
    max_cached_files: AtomicUsize,
    max_cache_size: AtomicU64,
    use_file_mapped_buffer: bool,
    etags: bool,
    precompressed_formats: Vec<CompressedContentFormat>,
    clock: Arc<dyn Clock>,
}

impl CacheShared {
    pub(crate) fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            stats: CacheStats::new(),
            max_cached_file_size: AtomicU64::new(config.max_cached_file_size),
            max_cached_files: AtomicUsize::new(config.max_cached_files),
            max_cache_size: AtomicU64::new(config.max_cache_size),
            use_file_mapped_buffer: config.use_file_mapped_buffer,
            etags: config.etags,
            precompressed_formats: config.precompressed_formats,
            clock: config.clock,
        }
    }

    pub(crate) fn max_cached_file_size(&self) -> u64 {
        self.max_cached_file_size.load(Ordering::Relaxed)
    }

    pub(crate) fn max_cached_files(&self) -> usize {
        self.max_cached_files.load(Ordering::Relaxed)
    }

    pub(crate) fn max_cache_size(&self) -> u64 {
        self.max_cache_size.load(Ordering::Relaxed)
    }

    pub(crate) fn use_file_mapped_buffer(&self) -> bool {
        self.use_file_mapped_buffer
    }

    pub(crate) fn etags(&self) -> bool {
        self.etags
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub(crate) fn over_bounds(&self) -> bool {
        self.stats.cached_files() > self.max_cached_files()
            || self.stats.cached_bytes() > self.max_cache_size()
    }

    /// Remove `content` from the map only if it is the entry mapped under its
    /// key. Returns whether it was removed.
    pub(crate) fn remove_if_mapped(&self, content: &CachedContent) -> bool {
        self.entries
            .remove_if(content.key(), |_, mapped| std::ptr::eq(Arc::as_ptr(mapped), content))
            .is_some()
    }

    /// The mapped entry for `path`, if it is still valid. The map guard is
    /// released before validation, which may remove the entry.
    fn valid_entry(&self, path: &str) -> Option<Arc<CachedContent>> {
        let content = self.entries.get(path).map(|e| Arc::clone(e.value()))?;
        content.is_valid().then_some(content)
    }

    /// Map `content` unless another entry won the race for its key; the
    /// loser is invalidated and the mapped entry returned.
    fn insert_if_absent(&self, content: Arc<CachedContent>) -> Arc<CachedContent> {
        let winner = match self.entries.entry(content.key().to_string()) {
            Entry::Occupied(mapped) => Some(Arc::clone(mapped.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&content));
                None
            }
        };
        match winner {
            Some(winner) => {
                trace!("lost insert race for {}", content.key());
                content.invalidate();
                winner
            }
            None => content,
        }
    }

    fn is_cacheable(&self, metadata: &ResourceMetadata) -> bool {
        if self.max_cached_files() == 0 {
            return false;
        }
        let len = metadata.length;
        len > 0
            && (self.use_file_mapped_buffer
                || (len < self.max_cached_file_size() && len < self.max_cache_size()))
    }
}

impl Drop for CacheShared {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.value().invalidate();
        }
    }
}

impl fmt::Debug for CacheShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheShared")
            .field("entries", &self.entries.len())
            .field("cached_files", &self.stats.cached_files())
            .field("cached_bytes", &self.stats.cached_bytes())
            .field("max_cached_file_size", &self.max_cached_file_size())
            .field("max_cached_files", &self.max_cached_files())
            .field("max_cache_size", &self.max_cache_size())
            .finish()
    }
}

/// A concurrent cache of static content with LRU eviction.
///
/// Cloning a `ContentCache` creates a new handle to the same entries.
///
/// ```
/// use std::sync::Arc;
/// use static_content_cache::{CacheConfig, ContentCache, MemoryResourceFactory};
///
/// let files = MemoryResourceFactory::new();
/// files.put("/index.html", "<h1>hello</h1>", 1_700_000_000_000);
///
/// let cache = ContentCache::new(CacheConfig::default(), Arc::new(files));
/// let content = cache.get_content("/index.html", 0).unwrap().unwrap();
/// assert_eq!(content.content_type(), Some("text/html"));
/// assert_eq!(content.indirect_buffer().unwrap().len(), 14);
/// assert_eq!(cache.cached_files(), 1);
/// ```
#[derive(Clone)]
pub struct ContentCache {
    shared: Arc<CacheShared>,
    factory: Arc<dyn ResourceFactory>,
    parent: Option<Box<ContentCache>>,
}

impl ContentCache {
    /// Create a cache over `factory`.
    pub fn new(config: CacheConfig, factory: Arc<dyn ResourceFactory>) -> Self {
        Self {
            shared: Arc::new(CacheShared::new(config)),
            factory,
            parent: None,
        }
    }

    /// Consult `parent` for paths this cache cannot resolve.
    pub fn with_parent(mut self, parent: ContentCache) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Look up the content for `path`.
    ///
    /// Returns `Ok(None)` when neither this cache nor any parent can find a
    /// resource. `max_buffer_size` bounds the buffers of uncached content
    /// (0 means no bound); cached content is bounded by the cache's own
    /// limits.
    pub fn get_content(
        &self,
        path: &str,
        max_buffer_size: u64,
    ) -> CacheResult<Option<Arc<dyn HttpContent>>> {
        if let Some(content) = self.shared.valid_entry(path) {
            self.shared.stats.record_hit();
            return Ok(Some(content));
        }
        self.shared.stats.record_miss();

        let resource = self.factory.resource(path)?;
        if let Some(content) = self.load(path, resource, max_buffer_size)? {
            return Ok(Some(content));
        }

        match &self.parent {
            Some(parent) => parent.get_content(path, max_buffer_size),
            None => Ok(None),
        }
    }

    fn load(
        &self,
        path: &str,
        resource: Arc<dyn Resource>,
        max_buffer_size: u64,
    ) -> CacheResult<Option<Arc<dyn HttpContent>>> {
        let Some(metadata) = resource.metadata()? else {
            return Ok(None);
        };

        if metadata.is_directory {
            let content = ResourceContent::new(
                resource,
                metadata,
                None,
                self.shared.max_cached_file_size(),
                self.shared.etags(),
                Vec::new(),
            );
            return Ok(Some(Arc::new(content)));
        }

        if self.shared.is_cacheable(&metadata) {
            let precompressed = self.cached_precompressed(path, &metadata);
            let content = CachedContent::new(
                path.to_string(),
                resource,
                metadata,
                precompressed,
                &self.shared,
            );
            let content = self.shared.insert_if_absent(content);
            debug!("cached {} ({} bytes)", path, metadata.length);
            if self.shared.over_bounds() {
                eviction::shrink(&self.shared);
            }
            return Ok(Some(content));
        }

        trace!("serving {} uncached", path);
        let variants = self.uncached_precompressed(path, &metadata, max_buffer_size);
        let content = ResourceContent::new(
            resource,
            metadata,
            headers::mime_type(path),
            max_buffer_size,
            self.shared.etags(),
            variants,
        );
        Ok(Some(Arc::new(content)))
    }

    /// Metadata of a precompressed sibling that may stand in for a source
    /// with `source` metadata.
    fn eligible_sibling(
        &self,
        path: &str,
        source: &ResourceMetadata,
    ) -> Option<(Arc<dyn Resource>, ResourceMetadata)> {
        let resource = match self.factory.resource(path) {
            Ok(resource) => resource,
            Err(e) => {
                debug!("could not resolve {}: {}", path, e);
                return None;
            }
        };
        let metadata = match resource.metadata() {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return None,
            Err(e) => {
                debug!("could not check {}: {}", path, e);
                return None;
            }
        };
        let eligible = !metadata.is_directory
            && metadata.length > 0
            && metadata.last_modified >= source.last_modified
            && metadata.length < source.length;
        eligible.then_some((resource, metadata))
    }

    fn cached_precompressed(
        &self,
        path: &str,
        source: &ResourceMetadata,
    ) -> IndexMap<CompressedContentFormat, Arc<CachedContent>> {
        let mut variants = IndexMap::new();
        for format in &self.shared.precompressed_formats {
            let variant_path = format.sibling_path(path);
            if let Some(variant) = self.shared.valid_entry(&variant_path) {
                variants.insert(*format, variant);
                continue;
            }
            if let Some((resource, metadata)) = self.eligible_sibling(&variant_path, source) {
                let variant =
                    CachedContent::new(variant_path, resource, metadata, IndexMap::new(), &self.shared);
                variants.insert(*format, self.shared.insert_if_absent(variant));
            }
        }
        variants
    }

    fn uncached_precompressed(
        &self,
        path: &str,
        source: &ResourceMetadata,
        max_buffer_size: u64,
    ) -> Vec<(CompressedContentFormat, Arc<dyn HttpContent>)> {
        let mut variants: Vec<(CompressedContentFormat, Arc<dyn HttpContent>)> = Vec::new();
        for format in &self.shared.precompressed_formats {
            let variant_path = format.sibling_path(path);
            if let Some(variant) = self.shared.valid_entry(&variant_path) {
                if variant.last_modified() >= source.last_modified {
                    variants.push((*format, variant as Arc<dyn HttpContent>));
                    continue;
                }
            }
            if let Some((resource, metadata)) = self.eligible_sibling(&variant_path, source) {
                let content = ResourceContent::new(
                    resource,
                    metadata,
                    headers::mime_type(&variant_path),
                    max_buffer_size,
                    self.shared.etags(),
                    Vec::new(),
                );
                variants.push((*format, Arc::new(content) as Arc<dyn HttpContent>));
            }
        }
        variants
    }

    /// The entry currently mapped for `path`.
    ///
    /// No freshness check is made and the hit and miss counters are left
    /// alone. The entry may already describe a stale resource, and it may be
    /// invalidated at any time by eviction, a flush, or a later
    /// [`get_content`](Self::get_content) that replaces it. Callers that serve
    /// content should use `get_content`.
    pub fn cached(&self, path: &str) -> Option<Arc<CachedContent>> {
        self.shared.entries.get(path).map(|e| Arc::clone(e.value()))
    }

    /// Invalidate every entry. Repeats until the map is observed empty, so
    /// entries inserted while flushing are removed too.
    pub fn flush_cache(&self) {
        while !self.shared.entries.is_empty() {
            let keys: Vec<String> = self.shared.entries.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((_, content)) = self.shared.entries.remove(&key) {
                    content.invalidate();
                }
            }
        }
        debug!("flushed cache");
    }

    /// Bytes held in counted buffers.
    pub fn cached_size(&self) -> u64 {
        self.shared.stats.cached_bytes()
    }

    /// Number of live entries.
    pub fn cached_files(&self) -> usize {
        self.shared.stats.cached_files()
    }

    pub fn max_cached_file_size(&self) -> u64 {
        self.shared.max_cached_file_size()
    }

    pub fn set_max_cached_file_size(&self, bytes: u64) {
        self.shared.max_cached_file_size.store(bytes, Ordering::Relaxed);
        eviction::shrink(&self.shared);
    }

    pub fn max_cached_files(&self) -> usize {
        self.shared.max_cached_files()
    }

    pub fn set_max_cached_files(&self, files: usize) {
        self.shared.max_cached_files.store(files, Ordering::Relaxed);
        eviction::shrink(&self.shared);
    }

    pub fn max_cache_size(&self) -> u64 {
        self.shared.max_cache_size()
    }

    pub fn set_max_cache_size(&self, bytes: u64) {
        self.shared.max_cache_size.store(bytes, Ordering::Relaxed);
        eviction::shrink(&self.shared);
    }

    pub fn is_use_file_mapped_buffer(&self) -> bool {
        self.shared.use_file_mapped_buffer()
    }

    pub fn precompressed_formats(&self) -> &[CompressedContentFormat] {
        &self.shared.precompressed_formats
    }

    /// Number of mapped entries.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Get a snapshot of the cache statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn parent(&self) -> Option<&ContentCache> {
        self.parent.as_deref()
    }
}

impl fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCache")
            .field("shared", &self.shared)
            .field("factory", &self.factory)
            .field("parent", &self.parent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resource::MemoryResourceFactory;

    fn cache_with(config: CacheConfig) -> (ContentCache, MemoryResourceFactory) {
        let factory = MemoryResourceFactory::new();
        let cache = ContentCache::new(config, Arc::new(factory.clone()));
        (cache, factory)
    }

    #[test]
    fn test_missing_resource() {
        let (cache, _) = cache_with(CacheConfig::default());
        assert!(cache.get_content("/missing.txt", 0).unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_hit_returns_same_entry() {
        let (cache, factory) = cache_with(CacheConfig::default());
        factory.put("/a.txt", "hello", 1);

        let first = cache.get_content("/a.txt", 0).unwrap().unwrap();
        let second = cache.get_content("/a.txt", 0).unwrap().unwrap();
        assert!(std::ptr::addr_eq(Arc::as_ptr(&first), Arc::as_ptr(&second)));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_directory_is_not_cached() {
        let (cache, factory) = cache_with(CacheConfig::default());
        factory.put_directory("/docs", 1);

        let content = cache.get_content("/docs", 0).unwrap().unwrap();
        assert!(content.indirect_buffer().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_file_is_not_cached() {
        let (cache, factory) = cache_with(CacheConfig::default());
        factory.put("/empty.txt", "", 1);

        let content = cache.get_content("/empty.txt", 0).unwrap().unwrap();
        assert_eq!(content.content_length(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cacheability_policy() {
        let (cache, factory) = cache_with(
            CacheConfig::new()
                .max_cached_file_size(10)
                .max_cache_size(100)
                .build(),
        );
        factory.put("/small.txt", "123456789", 1);
        factory.put("/exact.txt", "1234567890", 1);

        cache.get_content("/small.txt", 0).unwrap().unwrap();
        cache.get_content("/exact.txt", 0).unwrap().unwrap();
        assert!(cache.cached("/small.txt").is_some());
        assert!(cache.cached("/exact.txt").is_none());
    }

    #[test]
    fn test_mapped_buffers_bypass_size_bounds() {
        let (cache, factory) = cache_with(
            CacheConfig::new()
                .max_cached_file_size(4)
                .max_cache_size(4)
                .use_file_mapped_buffer(true)
                .build(),
        );
        factory.put("/big.txt", "0123456789", 1);

        cache.get_content("/big.txt", 0).unwrap().unwrap();
        assert!(cache.cached("/big.txt").is_some());
        assert_eq!(cache.cached_files(), 1);
    }

    #[test]
    fn test_zero_max_files_disables_caching() {
        let (cache, factory) = cache_with(CacheConfig::new().max_cached_files(0).build());
        factory.put("/a.txt", "hello", 1);

        let content = cache.get_content("/a.txt", 0).unwrap().unwrap();
        assert_eq!(content.indirect_buffer().as_deref(), Some(&b"hello"[..]));
        assert!(cache.is_empty());
        assert_eq!(cache.cached_files(), 0);
    }

    #[test]
    fn test_uncached_respects_max_buffer_size() {
        let (cache, factory) = cache_with(CacheConfig::new().max_cached_files(0).build());
        factory.put("/a.txt", "hello", 1);

        let content = cache.get_content("/a.txt", 3).unwrap().unwrap();
        assert!(content.indirect_buffer().is_none());
    }

    #[test]
    fn test_stale_entry_is_replaced() {
        let (cache, factory) = cache_with(CacheConfig::default());
        factory.put("/a.txt", "hello", 1);
        let old = cache.cached_after_get("/a.txt");
        old.indirect_buffer().unwrap();

        factory.put("/a.txt", "hello, world", 2);
        let new = cache.get_content("/a.txt", 0).unwrap().unwrap();
        assert_eq!(new.content_length(), 12);
        assert!(old.is_invalidated());
        assert_eq!(cache.cached_files(), 1);
        assert_eq!(cache.cached_size(), 0);
        assert_eq!(factory.closed_handles(), 1);
    }

    #[test]
    fn test_cached_skips_validation() {
        let (cache, factory) = cache_with(CacheConfig::default());
        factory.put("/a.txt", "hello", 1);
        assert!(cache.cached("/a.txt").is_none());
        cache.get_content("/a.txt", 0).unwrap().unwrap();

        factory.put("/a.txt", "hello, world", 2);
        let stale = cache.cached("/a.txt").unwrap();
        assert_eq!(stale.content_length(), 5);
        assert!(!stale.is_invalidated());
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 1);

        let fresh = cache.get_content("/a.txt", 0).unwrap().unwrap();
        assert_eq!(fresh.content_length(), 12);
        assert!(stale.is_invalidated());
        assert!(!std::ptr::eq(
            Arc::as_ptr(&stale),
            Arc::as_ptr(&cache.cached("/a.txt").unwrap())
        ));
    }

    #[test]
    fn test_setters_shrink_cache() {
        let clock = Arc::new(ManualClock::new(1));
        let (cache, factory) = cache_with(CacheConfig::new().clock(clock.clone()).build());
        for (i, name) in ["/a.txt", "/b.txt", "/c.txt"].iter().enumerate() {
            clock.set(i as u64 + 1);
            factory.put(*name, "0123456789", 1);
            cache.get_content(name, 0).unwrap().unwrap().indirect_buffer().unwrap();
        }
        assert_eq!(cache.cached_size(), 30);

        cache.set_max_cache_size(20);
        assert_eq!(cache.cached_size(), 20);
        assert!(cache.cached("/a.txt").is_none());

        cache.set_max_cached_files(1);
        assert_eq!(cache.cached_files(), 1);
        assert!(cache.cached("/c.txt").is_some());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_parent_delegation() {
        let parent_files = MemoryResourceFactory::new();
        parent_files.put("/shared.css", "body{}", 1);
        let parent = ContentCache::new(CacheConfig::default(), Arc::new(parent_files));

        let child_files = MemoryResourceFactory::new();
        child_files.put("/local.css", "p{}", 1);
        let child = ContentCache::new(CacheConfig::default(), Arc::new(child_files))
            .with_parent(parent.clone());

        assert!(child.get_content("/local.css", 0).unwrap().is_some());
        assert!(child.get_content("/shared.css", 0).unwrap().is_some());
        assert!(child.get_content("/nope.css", 0).unwrap().is_none());

        assert!(child.cached("/shared.css").is_none());
        assert!(parent.cached("/shared.css").is_some());
        assert_eq!(child.cached_files(), 1);
        assert_eq!(parent.cached_files(), 1);
    }

    impl ContentCache {
        fn cached_after_get(&self, path: &str) -> Arc<CachedContent> {
            self.get_content(path, 0).unwrap().unwrap();
            self.cached(path).unwrap()
        }
    }
}
