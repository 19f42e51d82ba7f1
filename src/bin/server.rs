//! Static file server.
//!
//! This binary serves files below a root directory over HTTP/1.1, one
//! request per connection, through a shared content cache.

use std::io::{self, Read};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use clap::Parser;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    signal,
    sync::mpsc,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use static_content_cache::{
    CacheError, CompressedContentFormat, ContentCache, FileResourceFactory, HttpContent,
    ServerArgs,
};

/// Largest request head accepted.
const MAX_HEAD: usize = 8 * 1024;

/// Read size for bodies streamed from their resource.
const STREAM_CHUNK: usize = 64 * 1024;

/// Entry point for the file server.
#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = ServerArgs::parse();
    let config = args.to_config();
    let factory = Arc::new(FileResourceFactory::new(&args.root));
    let cache = ContentCache::new(config, factory);

    let listener = TcpListener::bind(args.bind).await?;
    info!("serving {} on {}", args.root.display(), args.bind);
    info!(
        "max files={} max file size={} max cache size={} mapped={} etags={} precompressed={:?}",
        cache.max_cached_files(),
        cache.max_cached_file_size(),
        cache.max_cache_size(),
        cache.is_use_file_mapped_buffer(),
        args.etags,
        cache.precompressed_formats()
    );

    let shutdown_cache = cache.clone();
    tokio::spawn(async move {
        if let Ok(()) = signal::ctrl_c().await {
            shutdown(&shutdown_cache);
            std::process::exit(0);
        }
    });

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("connection from {}", addr);
                let cache = cache.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, cache).await {
                        warn!("connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

/// Log final statistics and release every cached resource.
fn shutdown(cache: &ContentCache) {
    let stats = cache.stats();
    info!(
        "shutting down: hits={} misses={} evictions={} files={} bytes={} hit_rate={:.1}%",
        stats.hits,
        stats.misses,
        stats.evictions,
        stats.cached_files,
        stats.cached_bytes,
        stats.hit_rate
    );
    cache.flush_cache();
}

/// A parsed request head.
#[derive(Debug)]
struct Request {
    method: String,
    path: String,
    if_none_match: Option<String>,
    accept_encoding: Option<String>,
}

/// Body of a response.
enum Body {
    Empty,
    Full(Bytes),
    /// Read from the resource in chunks while writing.
    Stream(Box<dyn Read + Send>),
}

/// A response ready to be written.
struct Response {
    status: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Body,
}

impl Response {
    fn status(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn encode_head(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if self.status != 304 && self.header_value("Content-Length").is_none() {
            let len = match &self.body {
                Body::Full(body) => body.len(),
                _ => 0,
            };
            head.push_str(&format!("Content-Length: {}\r\n", len));
        }
        head.push_str("Connection: close\r\n\r\n");
        head.into_bytes()
    }
}

/// Handle a single client connection.
async fn handle_connection(
    mut socket: TcpStream,
    cache: ContentCache,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = BytesMut::with_capacity(1024);

    let head_len = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_HEAD {
            let response = Response::status(431, "Request Header Fields Too Large");
            socket.write_all(&response.encode_head()).await?;
            return Ok(());
        }
        if socket.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    };

    let response = match parse_request(&buf[..head_len]) {
        Some(request) => {
            let method = request.method.clone();
            let path = request.path.clone();
            let response = tokio::task::spawn_blocking(move || respond(&cache, request)).await?;
            info!("{} {} {}", method, path, response.status);
            response
        }
        None => Response::status(400, "Bad Request"),
    };

    socket.write_all(&response.encode_head()).await?;
    write_body(&mut socket, response.body).await?;
    socket.flush().await?;
    Ok(())
}

async fn write_body(socket: &mut TcpStream, body: Body) -> io::Result<()> {
    match body {
        Body::Empty => Ok(()),
        Body::Full(body) => socket.write_all(&body).await,
        Body::Stream(reader) => {
            let (tx, mut rx) = mpsc::channel(4);
            tokio::task::spawn_blocking(move || pump(reader, tx));
            while let Some(chunk) = rx.recv().await {
                socket.write_all(&chunk?).await?;
            }
            Ok(())
        }
    }
}

/// Feed `reader` into `tx` one chunk at a time until it is exhausted or the
/// receiver goes away.
fn pump(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<io::Result<Bytes>>) {
    loop {
        let mut chunk = vec![0u8; STREAM_CHUNK];
        match reader.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                chunk.truncate(n);
                if tx.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_request(head: &[u8]) -> Option<Request> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?;
    let path = target.split(['?', '#']).next()?.to_string();
    if !path.starts_with('/') {
        return None;
    }

    let mut request = Request {
        method,
        path,
        if_none_match: None,
        accept_encoding: None,
    };
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':')?;
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("if-none-match") {
            request.if_none_match = Some(value);
        } else if name.eq_ignore_ascii_case("accept-encoding") {
            request.accept_encoding = Some(value);
        }
    }
    Some(request)
}

/// Resolve a request against the cache. Runs on the blocking pool since
/// cache misses read from disk.
fn respond(cache: &ContentCache, request: Request) -> Response {
    let head_only = match request.method.as_str() {
        "GET" => false,
        "HEAD" => true,
        _ => return Response::status(405, "Method Not Allowed").header("Allow", "GET, HEAD"),
    };

    // Content the cache declines to hold is buffered up to the same per-file
    // bound; larger bodies are streamed.
    let content = match cache.get_content(&request.path, cache.max_cached_file_size()) {
        Ok(Some(content)) => content,
        Ok(None) => return Response::status(404, "Not Found"),
        Err(CacheError::InvalidPath(_)) => return Response::status(400, "Bad Request"),
        Err(e) => {
            error!("failed to load {}: {}", request.path, e);
            return Response::status(500, "Internal Server Error");
        }
    };
    if content.resource().is_directory() {
        return Response::status(404, "Not Found");
    }

    let variants = content.precompressed_contents();
    let vary = !cache.precompressed_formats().is_empty();
    let chosen = request
        .accept_encoding
        .as_deref()
        .and_then(|accepted| variants.iter().find(|(format, _)| accepts(accepted, format)))
        .map(|(_, variant)| Arc::clone(variant))
        .unwrap_or(content);

    let mut response = serve(chosen.as_ref(), request.if_none_match.as_deref(), head_only);
    if vary {
        response = response.header("Vary", "Accept-Encoding");
    }
    response
}

fn serve(content: &dyn HttpContent, if_none_match: Option<&str>, head_only: bool) -> Response {
    if let (Some(etag), Some(tags)) = (content.etag(), if_none_match) {
        let matched = tags
            .split(',')
            .map(str::trim)
            .any(|tag| tag == "*" || CompressedContentFormat::tag_equals(etag, tag));
        if matched {
            return Response::status(304, "Not Modified").header("ETag", etag);
        }
    }

    let mut response = Response::status(200, "OK")
        .header("Content-Length", content.content_length_header());
    if let Some(content_type) = content.content_type() {
        response = response.header("Content-Type", content_type);
    }
    if let Some(encoding) = content.content_encoding() {
        response = response.header("Content-Encoding", encoding);
    }
    if let Some(last_modified) = content.last_modified_header() {
        response = response.header("Last-Modified", last_modified);
    }
    if let Some(etag) = content.etag() {
        response = response.header("ETag", etag);
    }

    if head_only {
        return response;
    }

    if let Some(body) = content.direct_buffer().or_else(|| content.indirect_buffer()) {
        response.body = Body::Full(body);
        return response;
    }
    match content.input_stream() {
        Ok(reader) => {
            response.body = Body::Stream(reader);
            response
        }
        Err(e) => {
            error!("failed to open body: {}", e);
            Response::status(500, "Internal Server Error")
        }
    }
}

/// Whether an `Accept-Encoding` value admits `format`.
fn accepts(accepted: &str, format: &CompressedContentFormat) -> bool {
    accepted.split(',').any(|item| {
        let mut parts = item.split(';').map(str::trim);
        let coding = parts.next().unwrap_or("");
        let rejected = parts.any(|param| {
            param
                .strip_prefix("q=")
                .and_then(|q| q.parse::<f32>().ok())
                .is_some_and(|q| q == 0.0)
        });
        !rejected && (coding.eq_ignore_ascii_case(format.encoding()) || coding == "*")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_content_cache::{CacheConfig, MemoryResourceFactory};

    fn cache_with(config: CacheConfig) -> (ContentCache, MemoryResourceFactory) {
        let files = MemoryResourceFactory::new();
        let cache = ContentCache::new(config, Arc::new(files.clone()));
        (cache, files)
    }

    fn request(method: &str, path: &str) -> Request {
        Request {
            method: method.to_string(),
            path: path.to_string(),
            if_none_match: None,
            accept_encoding: None,
        }
    }

    fn body_of(response: Response) -> Vec<u8> {
        match response.body {
            Body::Empty => Vec::new(),
            Body::Full(body) => body.to_vec(),
            Body::Stream(mut reader) => {
                let mut body = Vec::new();
                reader.read_to_end(&mut body).unwrap();
                body
            }
        }
    }

    #[test]
    fn test_parse_request() {
        let head = b"GET /app.js?v=3 HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: br, gzip\r\nIf-None-Match: W/\"abc\"\r\n\r\n";
        assert_eq!(find_head_end(head), Some(head.len()));

        let request = parse_request(head).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/app.js");
        assert_eq!(request.accept_encoding.as_deref(), Some("br, gzip"));
        assert_eq!(request.if_none_match.as_deref(), Some("W/\"abc\""));
    }

    #[test]
    fn test_parse_bad_requests() {
        assert!(parse_request(b"GET\r\n\r\n").is_none());
        assert!(parse_request(b"GET app.js HTTP/1.1\r\n\r\n").is_none());
        assert!(parse_request(b"GET /a HTTP/1.1\r\nno-colon\r\n\r\n").is_none());
        assert!(find_head_end(b"GET / HTTP/1.1\r\n").is_none());
    }

    #[test]
    fn test_accepts() {
        let gzip = CompressedContentFormat::GZIP;
        let br = CompressedContentFormat::BR;
        assert!(accepts("gzip, deflate", &gzip));
        assert!(!accepts("gzip, deflate", &br));
        assert!(accepts("GZIP;q=0.5", &gzip));
        assert!(!accepts("gzip;q=0, br", &gzip));
        assert!(accepts("gzip;q=0, br", &br));
        assert!(accepts("*", &br));
        assert!(!accepts("identity", &gzip));
    }

    #[test]
    fn test_method_not_allowed() {
        let (cache, _) = cache_with(CacheConfig::default());
        let response = respond(&cache, request("POST", "/a.txt"));
        assert_eq!(response.status, 405);
        assert_eq!(response.header_value("Allow"), Some("GET, HEAD"));
    }

    #[test]
    fn test_not_found() {
        let (cache, files) = cache_with(CacheConfig::default());
        files.put_directory("/docs", 1);
        assert_eq!(respond(&cache, request("GET", "/missing.txt")).status, 404);
        assert_eq!(respond(&cache, request("GET", "/docs")).status, 404);
    }

    #[test]
    fn test_get_and_head() {
        let (cache, files) = cache_with(CacheConfig::default());
        files.put("/index.html", "<p>hi</p>", 784_111_777_000);

        let response = respond(&cache, request("GET", "/index.html"));
        assert_eq!(response.status, 200);
        assert_eq!(response.header_value("Content-Type"), Some("text/html"));
        assert_eq!(response.header_value("Content-Length"), Some("9"));
        assert_eq!(
            response.header_value("Last-Modified"),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        assert!(response.header_value("Vary").is_none());
        assert_eq!(body_of(response), b"<p>hi</p>");

        let response = respond(&cache, request("HEAD", "/index.html"));
        assert_eq!(response.status, 200);
        assert_eq!(response.header_value("Content-Length"), Some("9"));
        assert!(matches!(response.body, Body::Empty));
    }

    #[test]
    fn test_if_none_match() {
        let (cache, files) = cache_with(
            CacheConfig::new()
                .etags(true)
                .precompressed_formats(vec![CompressedContentFormat::GZIP])
                .build(),
        );
        files.put("/app.js", vec![b'j'; 100], 1);
        files.put("/app.js.gz", vec![b'g'; 40], 1);

        let response = respond(&cache, request("GET", "/app.js"));
        let etag = response.header_value("ETag").unwrap().to_string();

        let mut conditional = request("GET", "/app.js");
        conditional.if_none_match = Some(etag.clone());
        let response = respond(&cache, conditional);
        assert_eq!(response.status, 304);
        assert!(matches!(response.body, Body::Empty));
        assert!(!String::from_utf8(response.encode_head()).unwrap().contains("Content-Length"));

        // The gzip etag names the same representation family.
        let mut compressed = request("GET", "/app.js");
        compressed.accept_encoding = Some("gzip".to_string());
        let response = respond(&cache, compressed);
        let gzip_etag = response.header_value("ETag").unwrap().to_string();
        assert!(gzip_etag.ends_with("--gzip\""));

        let mut conditional = request("GET", "/app.js");
        conditional.if_none_match = Some(format!("W/\"other\", {}", gzip_etag));
        assert_eq!(respond(&cache, conditional).status, 304);

        let mut conditional = request("GET", "/app.js");
        conditional.if_none_match = Some("W/\"other\"".to_string());
        assert_eq!(respond(&cache, conditional).status, 200);
    }

    #[test]
    fn test_precompressed_selection() {
        let (cache, files) = cache_with(
            CacheConfig::new()
                .precompressed_formats(vec![CompressedContentFormat::BR, CompressedContentFormat::GZIP])
                .build(),
        );
        files.put("/style.css", vec![b's'; 100], 1);
        files.put("/style.css.gz", vec![b'g'; 40], 1);

        let mut compressed = request("GET", "/style.css");
        compressed.accept_encoding = Some("br, gzip".to_string());
        let response = respond(&cache, compressed);
        assert_eq!(response.header_value("Content-Encoding"), Some("gzip"));
        assert_eq!(response.header_value("Content-Type"), Some("text/css"));
        assert_eq!(response.header_value("Vary"), Some("Accept-Encoding"));
        assert_eq!(body_of(response), vec![b'g'; 40]);

        let response = respond(&cache, request("GET", "/style.css"));
        assert!(response.header_value("Content-Encoding").is_none());
        assert_eq!(response.header_value("Vary"), Some("Accept-Encoding"));
        assert_eq!(body_of(response), vec![b's'; 100]);
    }

    #[test]
    fn test_oversized_body_is_streamed() {
        let (cache, files) = cache_with(CacheConfig::new().max_cached_file_size(16).build());
        files.put("/large.bin", vec![b'x'; 100], 1);

        let response = respond(&cache, request("GET", "/large.bin"));
        assert_eq!(response.status, 200);
        assert_eq!(response.header_value("Content-Length"), Some("100"));
        assert!(matches!(response.body, Body::Stream(_)));
        assert_eq!(body_of(response), vec![b'x'; 100]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pump_streams_in_chunks() {
        let data = vec![7u8; STREAM_CHUNK + 10];
        let (tx, mut rx) = mpsc::channel(4);
        let reader: Box<dyn Read + Send> = Box::new(io::Cursor::new(data.clone()));
        let pumping = std::thread::spawn(move || pump(reader, tx));

        let mut lengths = Vec::new();
        while let Some(chunk) = rx.blocking_recv() {
            lengths.push(chunk.unwrap().len());
        }
        pumping.join().unwrap();
        assert_eq!(lengths.iter().sum::<usize>(), data.len());
        assert!(lengths.iter().all(|len| *len <= STREAM_CHUNK));
    }

    #[test]
    fn test_shutdown_releases_entries() {
        let (cache, files) = cache_with(CacheConfig::default());
        files.put("/a.txt", "a", 1);
        files.put("/b.txt", "b", 1);
        respond(&cache, request("GET", "/a.txt"));
        respond(&cache, request("GET", "/b.txt"));
        assert_eq!(cache.cached_files(), 2);

        shutdown(&cache);
        assert!(cache.is_empty());
        assert_eq!(cache.cached_files(), 0);
        assert_eq!(cache.cached_size(), 0);
        assert_eq!(files.closed_handles(), 2);
    }
}
