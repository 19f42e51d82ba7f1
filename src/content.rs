//! The content view handed to request handlers.
//!
//! [`HttpContent`] is implemented by cached entries, by precompressed
//! variants, and by [`ResourceContent`], the uncached passthrough used for
//! directories and for files the cache declines to hold.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use tracing::debug;

use crate::buffer::{self, BufferKind};
use crate::headers;
use crate::precompressed::{CompressedContentFormat, PrecompressedContent};
use crate::resource::{Resource, ResourceMetadata};

/// Map of precompressed variants, in configured preference order.
pub type PrecompressedMap = IndexMap<CompressedContentFormat, Arc<dyn HttpContent>>;

/// A servable piece of static content.
pub trait HttpContent: Send + Sync + fmt::Debug {
    /// `Content-Type` header value.
    fn content_type(&self) -> Option<&str>;

    /// Charset carried by the content type.
    fn character_encoding(&self) -> Option<&str>;

    /// `Content-Encoding` header value; set only for precompressed variants.
    fn content_encoding(&self) -> Option<&str> {
        None
    }

    /// Length of the body in bytes.
    fn content_length(&self) -> u64;

    /// `Content-Length` header value.
    fn content_length_header(&self) -> &str;

    /// Last modification, in epoch milliseconds.
    fn last_modified(&self) -> Option<u64>;

    /// `Last-Modified` header value.
    fn last_modified_header(&self) -> Option<&str>;

    /// `ETag` header value, when etags are enabled.
    fn etag(&self) -> Option<&str>;

    /// The body as a heap buffer, if available.
    fn indirect_buffer(&self) -> Option<Bytes>;

    /// The body as a buffer suited to zero-copy writes, if available.
    fn direct_buffer(&self) -> Option<Bytes>;

    /// A reader over the body.
    fn input_stream(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Currently usable precompressed variants.
    fn precompressed_contents(&self) -> PrecompressedMap;

    /// The underlying resource.
    fn resource(&self) -> &Arc<dyn Resource>;
}

/// Header values shared by every content implementation.
#[derive(Debug, Clone)]
pub(crate) struct HeaderValues {
    pub(crate) content_type: Option<String>,
    pub(crate) character_encoding: Option<String>,
    pub(crate) content_length: String,
    pub(crate) last_modified: Option<String>,
    pub(crate) etag: Option<String>,
}

impl HeaderValues {
    pub(crate) fn new(
        resource: &dyn Resource,
        metadata: &ResourceMetadata,
        content_type: Option<&str>,
        etags: bool,
    ) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            character_encoding: content_type.and_then(headers::charset),
            content_length: metadata.length.to_string(),
            last_modified: metadata.last_modified.and_then(headers::http_date),
            etag: etags.then(|| resource.weak_etag(metadata, "")),
        }
    }
}

/// Content read straight from its resource on every access.
#[derive(Debug)]
pub struct ResourceContent {
    resource: Arc<dyn Resource>,
    metadata: ResourceMetadata,
    headers: HeaderValues,
    max_buffer_size: u64,
    precompressed: PrecompressedMap,
}

impl ResourceContent {
    /// Wrap a resource. Buffers are refused for bodies larger than
    /// `max_buffer_size` (0 means no limit). `variants` are raw sibling
    /// contents; they are exposed through [`PrecompressedContent`] adapters.
    pub fn new(
        resource: Arc<dyn Resource>,
        metadata: ResourceMetadata,
        content_type: Option<&str>,
        max_buffer_size: u64,
        etags: bool,
        variants: Vec<(CompressedContentFormat, Arc<dyn HttpContent>)>,
    ) -> Self {
        let headers = HeaderValues::new(resource.as_ref(), &metadata, content_type, etags);
        let precompressed = variants
            .into_iter()
            .map(|(format, variant)| {
                let etag = etags.then(|| resource.weak_etag(&metadata, format.etag_suffix()));
                let adapter = PrecompressedContent::new(
                    headers.content_type.clone(),
                    headers.character_encoding.clone(),
                    etag,
                    variant,
                    format,
                );
                (format, Arc::new(adapter) as Arc<dyn HttpContent>)
            })
            .collect();

        Self {
            resource,
            metadata,
            headers,
            max_buffer_size,
            precompressed,
        }
    }

    fn load(&self, kind: BufferKind) -> Option<Bytes> {
        if self.metadata.is_directory
            || (self.max_buffer_size > 0 && self.metadata.length > self.max_buffer_size)
        {
            return None;
        }
        match buffer::load(self.resource.as_ref(), self.metadata.length, kind) {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                debug!("could not load {}: {}", self.resource.name(), e);
                None
            }
        }
    }
}

impl HttpContent for ResourceContent {
    fn content_type(&self) -> Option<&str> {
        self.headers.content_type.as_deref()
    }

    fn character_encoding(&self) -> Option<&str> {
        self.headers.character_encoding.as_deref()
    }

    fn content_length(&self) -> u64 {
        self.metadata.length
    }

    fn content_length_header(&self) -> &str {
        &self.headers.content_length
    }

    fn last_modified(&self) -> Option<u64> {
        self.metadata.last_modified
    }

    fn last_modified_header(&self) -> Option<&str> {
        self.headers.last_modified.as_deref()
    }

    fn etag(&self) -> Option<&str> {
        self.headers.etag.as_deref()
    }

    fn indirect_buffer(&self) -> Option<Bytes> {
        self.load(BufferKind::Indirect)
    }

    fn direct_buffer(&self) -> Option<Bytes> {
        self.load(BufferKind::Direct)
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        self.resource.open()
    }

    fn precompressed_contents(&self) -> PrecompressedMap {
        self.precompressed.clone()
    }

    fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{MemoryResourceFactory, ResourceFactory};

    fn content(factory: &MemoryResourceFactory, path: &str, max: u64) -> ResourceContent {
        let resource = factory.resource(path).unwrap();
        let metadata = resource.metadata().unwrap().unwrap();
        ResourceContent::new(resource, metadata, headers::mime_type(path), max, true, Vec::new())
    }

    #[test]
    fn test_resource_content_headers() {
        let factory = MemoryResourceFactory::new();
        factory.put("/index.html", "<p>hi</p>", 784_111_777_000);
        let content = content(&factory, "/index.html", 0);

        assert_eq!(content.content_type(), Some("text/html"));
        assert_eq!(content.content_length(), 9);
        assert_eq!(content.content_length_header(), "9");
        assert_eq!(
            content.last_modified_header(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        assert!(content.etag().unwrap().starts_with("W/\""));
        assert!(content.precompressed_contents().is_empty());
    }

    #[test]
    fn test_resource_content_loads_every_time() {
        let factory = MemoryResourceFactory::new();
        factory.put("/a.txt", "abc", 1);
        let content = content(&factory, "/a.txt", 0);

        assert_eq!(content.indirect_buffer().as_deref(), Some(&b"abc"[..]));
        assert_eq!(content.direct_buffer().as_deref(), Some(&b"abc"[..]));
        assert_eq!(factory.opened_streams(), 2);
    }

    #[test]
    fn test_resource_content_respects_max_buffer_size() {
        let factory = MemoryResourceFactory::new();
        factory.put("/a.txt", "abcdef", 1);
        let content = content(&factory, "/a.txt", 3);

        assert!(content.indirect_buffer().is_none());
        assert!(content.direct_buffer().is_none());

        let mut body = String::new();
        content.input_stream().unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "abcdef");
    }

    #[test]
    fn test_directory_has_no_buffers() {
        let factory = MemoryResourceFactory::new();
        factory.put_directory("/docs", 1);
        let content = content(&factory, "/docs", 0);
        assert!(content.indirect_buffer().is_none());
        assert!(content.content_type().is_none());
    }
}
