//! Error types for the content cache.
//!
//! Only failures to resolve a resource or read its metadata reach callers.
//! Buffer load failures, stale entries and capacity pressure are handled
//! inside the cache and surface as `None` values instead.

use std::io;

use thiserror::Error;

/// The main error type for cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading a resource or its metadata failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested path cannot be mapped onto a resource (e.g. it escapes
    /// the resource root).
    #[error("invalid path: '{0}'")]
    InvalidPath(String),

    /// An unknown precompressed format name was configured.
    #[error("unknown precompressed format: '{0}'")]
    InvalidFormat(String),
}

/// A specialized Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
