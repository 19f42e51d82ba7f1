//! Cached entry: metadata snapshot plus lazily loaded buffers for one path.

use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use bytes::{Buf, Bytes};
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::buffer::{self, BufferKind};
use crate::cache::CacheShared;
use crate::content::{HeaderValues, HttpContent, PrecompressedMap};
use crate::eviction;
use crate::headers;
use crate::precompressed::{CachedPrecompressedContent, CompressedContentFormat};
use crate::resource::{Resource, ResourceMetadata};
use crate::stats::CacheStats;

/// A nullable buffer cell. Filled by compare-and-swap from empty, emptied
/// by an exchange, so each published buffer is released at most once.
#[derive(Debug, Default)]
struct BufferSlot {
    buffer: ArcSwapOption<Bytes>,
}

impl BufferSlot {
    fn get(&self) -> Option<Bytes> {
        self.buffer.load().as_deref().cloned()
    }

    /// Fill the slot if it is empty. Returns the buffer now held by the slot
    /// and whether it was ours; a losing buffer is dropped.
    fn offer(&self, loaded: Bytes) -> (Bytes, bool) {
        let previous = self
            .buffer
            .compare_and_swap(&None::<Arc<Bytes>>, Some(Arc::new(loaded.clone())));
        match previous.as_deref() {
            None => (loaded, true),
            Some(winner) => (winner.clone(), false),
        }
    }

    /// Offer a freshly loaded buffer and account for it if it wins.
    fn publish(&self, loaded: Bytes, stats: &CacheStats) -> (Bytes, bool) {
        let len = loaded.len() as u64;
        // Counted before publication so a concurrent release never subtracts
        // bytes that were not yet added.
        stats.add_bytes(len);
        let (buffer, ours) = self.offer(loaded);
        if !ours {
            stats.sub_bytes(len);
        }
        (buffer, ours)
    }

    /// Empty the slot and subtract whatever it held.
    fn release(&self, stats: &CacheStats) {
        if let Some(buffer) = self.buffer.swap(None) {
            stats.sub_bytes(buffer.len() as u64);
        }
    }

    fn clear(&self) {
        self.buffer.store(None);
    }
}

#[derive(Debug)]
struct PrecompressedLink {
    variant: Arc<CachedContent>,
    etag: Option<String>,
}

/// One cache record.
///
/// Header values are computed once at construction. Buffers are loaded on
/// first use and shared by every reader until the entry is invalidated.
pub struct CachedContent {
    key: String,
    resource: Arc<dyn Resource>,
    metadata: ResourceMetadata,
    headers: HeaderValues,
    precompressed: IndexMap<CompressedContentFormat, PrecompressedLink>,
    indirect: BufferSlot,
    direct: BufferSlot,
    mapped: BufferSlot,
    last_accessed: AtomicU64,
    invalidated: AtomicBool,
    cache: Weak<CacheShared>,
    this: Weak<CachedContent>,
}

impl CachedContent {
    /// Build an entry and register it in the cache's file count.
    pub(crate) fn new(
        key: String,
        resource: Arc<dyn Resource>,
        metadata: ResourceMetadata,
        precompressed: IndexMap<CompressedContentFormat, Arc<CachedContent>>,
        cache: &Arc<CacheShared>,
    ) -> Arc<Self> {
        let etags = cache.etags();
        let headers = HeaderValues::new(
            resource.as_ref(),
            &metadata,
            headers::mime_type(resource.name()),
            etags,
        );
        let precompressed = precompressed
            .into_iter()
            .map(|(format, variant)| {
                let etag = etags.then(|| resource.weak_etag(&metadata, format.etag_suffix()));
                (format, PrecompressedLink { variant, etag })
            })
            .collect();

        cache.stats.increment_files();

        Arc::new_cyclic(|this| Self {
            key,
            resource,
            metadata,
            headers,
            precompressed,
            indirect: BufferSlot::default(),
            direct: BufferSlot::default(),
            mapped: BufferSlot::default(),
            last_accessed: AtomicU64::new(cache.now_millis()),
            invalidated: AtomicBool::new(false),
            cache: Arc::downgrade(cache),
            this: this.clone(),
        })
    }

    /// The cache key this entry is stored under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Millisecond stamp of the last successful validity check.
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    pub(crate) fn touch_at(&self, millis: u64) {
        self.last_accessed.store(millis, Ordering::Relaxed);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Check the snapshot against the live resource.
    ///
    /// A fresh entry has its last-accessed stamp refreshed. A stale entry is
    /// removed from the cache (if it is still the mapped entry for its key)
    /// and invalidated. An entry that was already invalidated is never valid.
    pub fn is_valid(&self) -> bool {
        if self.is_invalidated() {
            return false;
        }
        let cache = self.cache.upgrade();
        let fresh = match self.resource.metadata() {
            Ok(Some(live)) => {
                !live.is_directory
                    && live.length == self.metadata.length
                    && live.last_modified == self.metadata.last_modified
            }
            Ok(None) => false,
            Err(e) => {
                debug!("could not check {}: {}", self.key, e);
                false
            }
        };

        if fresh {
            if let Some(cache) = &cache {
                self.touch_at(cache.now_millis());
            }
            return true;
        }

        trace!("stale entry {}", self.key);
        if let Some(cache) = &cache {
            cache.remove_if_mapped(self);
        }
        self.invalidate();
        false
    }

    /// Release buffers, accounting and the resource handle. Runs once; later
    /// calls do nothing.
    pub fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            self.indirect.release(&cache.stats);
            self.direct.release(&cache.stats);
            cache.stats.decrement_files();
            cache.stats.record_invalidation();
        } else {
            self.indirect.clear();
            self.direct.clear();
        }
        // The mapped buffer was never counted.
        self.mapped.clear();
        self.resource.close();
        trace!("invalidated {}", self.key);
    }

    fn load(&self, kind: BufferKind, stats: Option<&CacheStats>) -> Option<Bytes> {
        match buffer::load(self.resource.as_ref(), self.metadata.length, kind) {
            Ok(buffer) => {
                if let Some(stats) = stats {
                    stats.record_load();
                }
                Some(buffer)
            }
            Err(e) => {
                if let Some(stats) = stats {
                    stats.record_load_failure();
                }
                debug!("could not load {:?} buffer for {}: {}", kind, self.key, e);
                None
            }
        }
    }

    /// Load into `slot` unless it is already populated, then enforce the size
    /// bound.
    fn populate(&self, slot: &BufferSlot, kind: BufferKind, cache: &CacheShared) -> Option<Bytes> {
        if let Some(buffer) = slot.get() {
            return Some(buffer);
        }
        if self.is_invalidated() {
            return self.load(kind, Some(&cache.stats));
        }

        let loaded = self.load(kind, Some(&cache.stats))?;
        let (buffer, ours) = slot.publish(loaded, &cache.stats);
        if ours {
            if self.is_invalidated() {
                // Invalidation may have emptied the slot before it was filled.
                slot.release(&cache.stats);
            } else if cache.stats.cached_bytes() > cache.max_cache_size() {
                eviction::shrink(cache);
            }
        }
        Some(buffer)
    }

    /// Heap buffer holding the whole body.
    ///
    /// Refused for bodies larger than the per-file bound, even though the
    /// entry itself may be cached through a mapped buffer.
    pub fn indirect_buffer(&self) -> Option<Bytes> {
        let Some(cache) = self.cache.upgrade() else {
            return self.indirect.get().or_else(|| self.load(BufferKind::Indirect, None));
        };
        if self.metadata.length > cache.max_cached_file_size() {
            return None;
        }
        self.populate(&self.indirect, BufferKind::Indirect, &cache)
    }

    /// Buffer for zero-copy writes: a mapped buffer when mapping is enabled
    /// and the resource is file-backed, otherwise a counted direct buffer.
    pub fn direct_buffer(&self) -> Option<Bytes> {
        if let Some(mapped) = self.mapped.get() {
            return Some(mapped);
        }
        if let Some(direct) = self.direct.get() {
            return Some(direct);
        }
        let cache = self.cache.upgrade()?;

        if cache.use_file_mapped_buffer() {
            match buffer::map(self.resource.as_ref()) {
                Ok(Some(mapped)) => {
                    if self.is_invalidated() {
                        return Some(mapped);
                    }
                    let (mapped, ours) = self.mapped.offer(mapped);
                    if ours && self.is_invalidated() {
                        self.mapped.clear();
                    }
                    return Some(mapped);
                }
                Ok(None) => {}
                Err(e) => debug!("could not map {}: {}", self.key, e),
            }
        }

        if self.metadata.length < cache.max_cached_file_size() {
            self.populate(&self.direct, BufferKind::Direct, &cache)
        } else {
            None
        }
    }

    /// Reader over the cached heap buffer, or over the resource itself when
    /// no heap buffer can be held.
    pub fn input_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        match self.indirect_buffer() {
            Some(buffer) => Ok(Box::new(buffer.reader())),
            None => self.resource.open(),
        }
    }

    /// Valid precompressed variants of this entry.
    pub fn precompressed_variants(&self) -> IndexMap<CompressedContentFormat, Arc<CachedPrecompressedContent>> {
        let Some(this) = self.this.upgrade() else {
            return IndexMap::new();
        };
        self.precompressed
            .iter()
            .map(|(format, link)| {
                let content = CachedPrecompressedContent::new(
                    Arc::clone(&this),
                    Arc::clone(&link.variant),
                    *format,
                    link.etag.clone(),
                );
                (*format, Arc::new(content))
            })
            .filter(|(_, content)| content.is_valid())
            .collect()
    }

    pub fn content_length(&self) -> u64 {
        self.metadata.length
    }

    pub fn last_modified(&self) -> Option<u64> {
        self.metadata.last_modified
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.content_type.as_deref()
    }

    pub fn character_encoding(&self) -> Option<&str> {
        self.headers.character_encoding.as_deref()
    }

    pub fn content_length_header(&self) -> &str {
        &self.headers.content_length
    }

    pub fn last_modified_header(&self) -> Option<&str> {
        self.headers.last_modified.as_deref()
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.etag.as_deref()
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }
}

impl HttpContent for CachedContent {
    fn content_type(&self) -> Option<&str> {
        CachedContent::content_type(self)
    }

    fn character_encoding(&self) -> Option<&str> {
        CachedContent::character_encoding(self)
    }

    fn content_length(&self) -> u64 {
        CachedContent::content_length(self)
    }

    fn content_length_header(&self) -> &str {
        CachedContent::content_length_header(self)
    }

    fn last_modified(&self) -> Option<u64> {
        CachedContent::last_modified(self)
    }

    fn last_modified_header(&self) -> Option<&str> {
        CachedContent::last_modified_header(self)
    }

    fn etag(&self) -> Option<&str> {
        CachedContent::etag(self)
    }

    fn indirect_buffer(&self) -> Option<Bytes> {
        CachedContent::indirect_buffer(self)
    }

    fn direct_buffer(&self) -> Option<Bytes> {
        CachedContent::direct_buffer(self)
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        CachedContent::input_stream(self)
    }

    fn precompressed_contents(&self) -> PrecompressedMap {
        self.precompressed_variants()
            .into_iter()
            .map(|(format, content)| (format, content as Arc<dyn HttpContent>))
            .collect()
    }

    fn resource(&self) -> &Arc<dyn Resource> {
        CachedContent::resource(self)
    }
}

impl fmt::Debug for CachedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedContent")
            .field("key", &self.key)
            .field("length", &self.metadata.length)
            .field("last_modified", &self.metadata.last_modified)
            .field("content_type", &self.headers.content_type)
            .field("last_accessed", &self.last_accessed())
            .field("precompressed", &self.precompressed.len())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}
