//! Command-line interface definitions.
//!
//! This module defines the arguments of the static file server using clap.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{
    CacheConfig, DEFAULT_MAX_CACHED_FILES, DEFAULT_MAX_CACHED_FILE_SIZE, DEFAULT_MAX_CACHE_SIZE,
};
use crate::precompressed::CompressedContentFormat;

/// Static file server backed by the content cache.
#[derive(Parser, Debug)]
#[command(name = "static-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
    /// Directory to serve files from.
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Maximum number of cached files.
    #[arg(long, default_value_t = DEFAULT_MAX_CACHED_FILES)]
    pub max_cached_files: usize,

    /// Files of this many bytes or more are served uncached.
    #[arg(long, default_value_t = DEFAULT_MAX_CACHED_FILE_SIZE)]
    pub max_cached_file_size: u64,

    /// Maximum number of buffered bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_CACHE_SIZE)]
    pub max_cache_size: u64,

    /// Serve files from memory-mapped buffers.
    #[arg(long)]
    pub mapped: bool,

    /// Send weak etags and answer If-None-Match.
    #[arg(long)]
    pub etags: bool,

    /// Precompressed formats to look for, in order of preference.
    ///
    /// Accepts `br` and `gzip`, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub precompressed: Vec<CompressedContentFormat>,
}

impl ServerArgs {
    /// The cache configuration described by these arguments.
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig::new()
            .max_cached_files(self.max_cached_files)
            .max_cached_file_size(self.max_cached_file_size)
            .max_cache_size(self.max_cache_size)
            .use_file_mapped_buffer(self.mapped)
            .etags(self.etags)
            .precompressed_formats(self.precompressed.clone())
            .build()
    }
}
