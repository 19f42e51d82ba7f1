//! # Static Content Cache
//!
//! A concurrent, size-bounded cache of static file content and metadata for
//! HTTP servers.
//!
//! ## Features
//!
//! - **Lock-free reads**: entries live in a sharded concurrent map and their
//!   buffers are published once and shared as immutable [`bytes::Bytes`]
//! - **Two bounds**: a maximum number of cached files and a maximum number
//!   of buffered bytes, enforced by least-recently-used eviction
//! - **Freshness checks**: every lookup compares the cached length and
//!   modification time with the live resource
//! - **Precompressed variants**: `.br`/`.gz` siblings are found, cached and
//!   served with their own etags
//! - **Parent caches**: a cache can fall back to another one for paths it
//!   cannot resolve
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use static_content_cache::{CacheConfig, CompressedContentFormat, ContentCache, MemoryResourceFactory};
//!
//! let files = MemoryResourceFactory::new();
//! files.put("/app.js", "console.log('hello, world');", 1_700_000_000_000);
//! files.put("/app.js.gz", "gzipped", 1_700_000_000_000);
//!
//! let config = CacheConfig::new()
//!     .max_cached_files(1024)
//!     .max_cache_size(64 * 1024 * 1024)
//!     .etags(true)
//!     .precompressed_formats(vec![CompressedContentFormat::GZIP])
//!     .build();
//! let cache = ContentCache::new(config, Arc::new(files));
//!
//! let content = cache.get_content("/app.js", 0).unwrap().unwrap();
//! assert_eq!(content.content_type(), Some("text/javascript"));
//!
//! let variants = content.precompressed_contents();
//! let gzip = &variants[&CompressedContentFormat::GZIP];
//! assert_eq!(gzip.content_encoding(), Some("gzip"));
//! assert!(gzip.etag().unwrap().ends_with("--gzip\""));
//! ```
//!
//! ## Thread Safety
//!
//! `ContentCache` is a cheap handle; clones share the same entries and
//! counters:
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use static_content_cache::{CacheConfig, ContentCache, MemoryResourceFactory};
//!
//! let files = MemoryResourceFactory::new();
//! files.put("/a.txt", "shared", 1);
//! let cache = ContentCache::new(CacheConfig::default(), Arc::new(files));
//!
//! let handles: Vec<_> = (0..4).map(|_| {
//!     let cache = cache.clone();
//!     thread::spawn(move || cache.get_content("/a.txt", 0).unwrap().is_some())
//! }).collect();
//!
//! for handle in handles {
//!     assert!(handle.join().unwrap());
//! }
//! assert_eq!(cache.cached_files(), 1);
//! ```

pub mod buffer;
pub mod cache;
pub mod clock;
pub mod config;
pub mod content;
pub mod entry;
pub mod error;
pub mod headers;
pub mod precompressed;
pub mod resource;
pub mod stats;

pub(crate) mod eviction;

pub use cache::ContentCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use content::{HttpContent, PrecompressedMap, ResourceContent};
pub use entry::CachedContent;
pub use error::{CacheError, CacheResult};
pub use precompressed::{CachedPrecompressedContent, CompressedContentFormat, PrecompressedContent};
pub use resource::{
    FileResource, FileResourceFactory, MemoryResource, MemoryResourceFactory, Resource,
    ResourceFactory, ResourceMetadata,
};
pub use stats::{CacheStats, StatsSnapshot};

pub mod cli;
pub use cli::ServerArgs;
