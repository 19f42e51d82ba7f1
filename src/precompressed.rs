//! Precompressed variants.
//!
//! A precompressed variant is a sibling resource such as `app.js.gz` that
//! holds an encoded copy of `app.js`. The variant is served with the
//! source's content type, its own length and body, and an etag derived from
//! the source's etag plus a per-format suffix.

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::content::{HttpContent, PrecompressedMap};
use crate::entry::CachedContent;
use crate::error::CacheError;
use crate::resource::Resource;

/// A content coding and the file extension its precompressed siblings use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompressedContentFormat {
    encoding: &'static str,
    extension: &'static str,
    etag_suffix: &'static str,
}

impl CompressedContentFormat {
    pub const GZIP: CompressedContentFormat = CompressedContentFormat::new("gzip", ".gz", "--gzip");
    pub const BR: CompressedContentFormat = CompressedContentFormat::new("br", ".br", "--br");

    pub const fn new(
        encoding: &'static str,
        extension: &'static str,
        etag_suffix: &'static str,
    ) -> Self {
        Self {
            encoding,
            extension,
            etag_suffix,
        }
    }

    /// `Content-Encoding` value, e.g. `gzip`.
    pub fn encoding(&self) -> &'static str {
        self.encoding
    }

    /// Suffix appended to the source path, e.g. `.gz`.
    pub fn extension(&self) -> &'static str {
        self.extension
    }

    /// Suffix appended inside the quoted etag, e.g. `--gzip`.
    pub fn etag_suffix(&self) -> &'static str {
        self.etag_suffix
    }

    /// Path of this format's sibling of `path`.
    pub fn sibling_path(&self, path: &str) -> String {
        format!("{}{}", path, self.extension)
    }

    /// Compare two etags, ignoring any precompressed-format suffix.
    pub fn tag_equals(etag: &str, tag: &str) -> bool {
        strip_suffix(etag) == strip_suffix(tag)
    }
}

fn strip_suffix(tag: &str) -> &str {
    let quoted = tag.ends_with('"');
    let body = tag.trim_end_matches('"');
    match body.rfind("--") {
        Some(at) if quoted => &body[..at],
        _ => body,
    }
}

impl fmt::Display for CompressedContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding)
    }
}

impl FromStr for CompressedContentFormat {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(Self::GZIP),
            "br" | "brotli" => Ok(Self::BR),
            other => Err(CacheError::InvalidFormat(other.to_string())),
        }
    }
}

/// An uncached variant presented with its source's type and etag.
#[derive(Debug)]
pub struct PrecompressedContent {
    content_type: Option<String>,
    character_encoding: Option<String>,
    etag: Option<String>,
    variant: Arc<dyn HttpContent>,
    format: CompressedContentFormat,
}

impl PrecompressedContent {
    pub fn new(
        content_type: Option<String>,
        character_encoding: Option<String>,
        etag: Option<String>,
        variant: Arc<dyn HttpContent>,
        format: CompressedContentFormat,
    ) -> Self {
        Self {
            content_type,
            character_encoding,
            etag,
            variant,
            format,
        }
    }

    pub fn format(&self) -> CompressedContentFormat {
        self.format
    }
}

impl HttpContent for PrecompressedContent {
    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn character_encoding(&self) -> Option<&str> {
        self.character_encoding.as_deref()
    }

    fn content_encoding(&self) -> Option<&str> {
        Some(self.format.encoding)
    }

    fn content_length(&self) -> u64 {
        self.variant.content_length()
    }

    fn content_length_header(&self) -> &str {
        self.variant.content_length_header()
    }

    fn last_modified(&self) -> Option<u64> {
        self.variant.last_modified()
    }

    fn last_modified_header(&self) -> Option<&str> {
        self.variant.last_modified_header()
    }

    fn etag(&self) -> Option<&str> {
        self.etag.as_deref().or_else(|| self.variant.etag())
    }

    fn indirect_buffer(&self) -> Option<Bytes> {
        self.variant.indirect_buffer()
    }

    fn direct_buffer(&self) -> Option<Bytes> {
        self.variant.direct_buffer()
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        self.variant.input_stream()
    }

    fn precompressed_contents(&self) -> PrecompressedMap {
        PrecompressedMap::new()
    }

    fn resource(&self) -> &Arc<dyn Resource> {
        self.variant.resource()
    }
}

/// A cached variant linked to its cached source.
///
/// Usable only while both entries are valid and the source has not been
/// modified after the variant.
#[derive(Debug)]
pub struct CachedPrecompressedContent {
    source: Arc<CachedContent>,
    variant: Arc<CachedContent>,
    format: CompressedContentFormat,
    etag: Option<String>,
}

impl CachedPrecompressedContent {
    pub(crate) fn new(
        source: Arc<CachedContent>,
        variant: Arc<CachedContent>,
        format: CompressedContentFormat,
        etag: Option<String>,
    ) -> Self {
        Self {
            source,
            variant,
            format,
            etag,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.variant.is_valid()
            && self.source.is_valid()
            && self.source.last_modified() <= self.variant.last_modified()
    }

    pub fn format(&self) -> CompressedContentFormat {
        self.format
    }

    pub fn source(&self) -> &Arc<CachedContent> {
        &self.source
    }

    pub fn variant(&self) -> &Arc<CachedContent> {
        &self.variant
    }
}

impl HttpContent for CachedPrecompressedContent {
    fn content_type(&self) -> Option<&str> {
        self.source.content_type()
    }

    fn character_encoding(&self) -> Option<&str> {
        self.source.character_encoding()
    }

    fn content_encoding(&self) -> Option<&str> {
        Some(self.format.encoding)
    }

    fn content_length(&self) -> u64 {
        self.variant.content_length()
    }

    fn content_length_header(&self) -> &str {
        self.variant.content_length_header()
    }

    fn last_modified(&self) -> Option<u64> {
        self.variant.last_modified()
    }

    fn last_modified_header(&self) -> Option<&str> {
        self.variant.last_modified_header()
    }

    fn etag(&self) -> Option<&str> {
        self.etag.as_deref().or_else(|| self.variant.etag())
    }

    fn indirect_buffer(&self) -> Option<Bytes> {
        self.variant.indirect_buffer()
    }

    fn direct_buffer(&self) -> Option<Bytes> {
        self.variant.direct_buffer()
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        self.variant.input_stream()
    }

    fn precompressed_contents(&self) -> PrecompressedMap {
        PrecompressedMap::new()
    }

    fn resource(&self) -> &Arc<dyn Resource> {
        self.variant.resource()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        assert_eq!("gzip".parse::<CompressedContentFormat>().unwrap(), CompressedContentFormat::GZIP);
        assert_eq!("BR".parse::<CompressedContentFormat>().unwrap(), CompressedContentFormat::BR);
        assert!(matches!(
            "zstd".parse::<CompressedContentFormat>(),
            Err(CacheError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_sibling_path() {
        assert_eq!(CompressedContentFormat::GZIP.sibling_path("/app.js"), "/app.js.gz");
        assert_eq!(CompressedContentFormat::BR.sibling_path("/app.js"), "/app.js.br");
    }

    #[test]
    fn test_tag_equals() {
        assert!(CompressedContentFormat::tag_equals("W/\"abc\"", "W/\"abc--gzip\""));
        assert!(CompressedContentFormat::tag_equals("W/\"abc--br\"", "W/\"abc\""));
        assert!(!CompressedContentFormat::tag_equals("W/\"abc\"", "W/\"abd\""));
    }
}
