//! Configuration for the content cache.
//!
//! This module provides a builder for the capacity bounds and feature flags
//! of a [`ContentCache`](crate::ContentCache). The three bounds can also be
//! changed at runtime through the cache's setters.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::precompressed::CompressedContentFormat;

/// Default largest single file that is buffered (128 MiB).
pub const DEFAULT_MAX_CACHED_FILE_SIZE: u64 = 128 * 1024 * 1024;
/// Default maximum number of cached files.
pub const DEFAULT_MAX_CACHED_FILES: usize = 2048;
/// Default maximum total buffered bytes (256 MiB).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 256 * 1024 * 1024;

/// Configuration for creating a new content cache.
///
/// ```
/// use static_content_cache::{CacheConfig, CompressedContentFormat};
///
/// let config = CacheConfig::new()
///     .max_cached_files(512)
///     .max_cache_size(64 * 1024 * 1024)
///     .etags(true)
///     .precompressed_formats(vec![CompressedContentFormat::BR, CompressedContentFormat::GZIP])
///     .build();
/// assert_eq!(config.get_max_cached_files(), 512);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Files at least this large are never buffered on the heap.
    pub(crate) max_cached_file_size: u64,

    /// Maximum number of entries. Zero disables caching.
    pub(crate) max_cached_files: usize,

    /// Maximum number of buffered bytes across all entries.
    pub(crate) max_cache_size: u64,

    /// Serve cached files from memory-mapped buffers.
    pub(crate) use_file_mapped_buffer: bool,

    /// Compute weak etags for cached content.
    pub(crate) etags: bool,

    /// Sibling formats looked up for every cached path, in preference order.
    pub(crate) precompressed_formats: Vec<CompressedContentFormat>,

    /// Source of last-accessed stamps.
    pub(crate) clock: Arc<dyn Clock>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cached_file_size: DEFAULT_MAX_CACHED_FILE_SIZE,
            max_cached_files: DEFAULT_MAX_CACHED_FILES,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            use_file_mapped_buffer: false,
            etags: false,
            precompressed_formats: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size below which a single file may be buffered.
    pub fn max_cached_file_size(mut self, bytes: u64) -> Self {
        self.max_cached_file_size = bytes;
        self
    }

    /// Set the maximum number of cached files.
    ///
    /// A value of 0 disables caching entirely; every lookup then returns
    /// uncached content.
    pub fn max_cached_files(mut self, files: usize) -> Self {
        self.max_cached_files = files;
        self
    }

    /// Set the maximum number of buffered bytes.
    pub fn max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Allow memory-mapped buffers.
    ///
    /// Mapped buffers are not counted against the byte bound, so any
    /// non-empty file becomes cacheable when this is enabled.
    pub fn use_file_mapped_buffer(mut self, enabled: bool) -> Self {
        self.use_file_mapped_buffer = enabled;
        self
    }

    /// Enable or disable weak etag generation.
    pub fn etags(mut self, enabled: bool) -> Self {
        self.etags = enabled;
        self
    }

    /// Set the precompressed formats to look up, in preference order.
    pub fn precompressed_formats(mut self, formats: Vec<CompressedContentFormat>) -> Self {
        self.precompressed_formats = formats;
        self
    }

    /// Replace the clock used for last-accessed stamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> Self {
        self
    }

    /// Get the per-file size bound.
    pub fn get_max_cached_file_size(&self) -> u64 {
        self.max_cached_file_size
    }

    /// Get the file count bound.
    pub fn get_max_cached_files(&self) -> usize {
        self.max_cached_files
    }

    /// Get the total size bound.
    pub fn get_max_cache_size(&self) -> u64 {
        self.max_cache_size
    }

    /// Get the configured precompressed formats.
    pub fn get_precompressed_formats(&self) -> &[CompressedContentFormat] {
        &self.precompressed_formats
    }
}
