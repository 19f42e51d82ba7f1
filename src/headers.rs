//! Precomputed header values: content type, dates and weak etags.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::resource::ResourceMetadata;

const MIME_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
    ("json", "application/json"),
    ("map", "application/json"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("xml", "application/xml"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("avif", "image/avif"),
    ("ico", "image/x-icon"),
    ("wasm", "application/wasm"),
    ("pdf", "application/pdf"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mp3", "audio/mpeg"),
    ("gz", "application/gzip"),
    ("br", "application/x-brotli"),
    ("zip", "application/zip"),
];

/// Content type for a name, looked up by extension (case-insensitive).
pub fn mime_type(name: &str) -> Option<&'static str> {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (_, extension) = file_name.rsplit_once('.')?;
    let extension = extension.to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
}

/// The `charset` parameter of a content type, if any.
pub fn charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Format epoch milliseconds as an IMF-fixdate.
pub fn http_date(millis: u64) -> Option<String> {
    let time = DateTime::<Utc>::from_timestamp_millis(i64::try_from(millis).ok()?)?;
    Some(time.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

/// Weak etag derived from a resource's name, length and modification time.
pub fn weak_etag(name: &str, metadata: &ResourceMetadata, suffix: &str) -> String {
    let hash = name
        .chars()
        .fold(0i64, |h, c| h.wrapping_mul(31).wrapping_add(c as i64));
    let modified = metadata.last_modified.unwrap_or(0) as i64 ^ hash;
    let length = metadata.length as i64 ^ hash;

    let mut etag = String::with_capacity(32);
    etag.push_str("W/\"");
    etag.push_str(&STANDARD_NO_PAD.encode(modified.to_be_bytes()));
    etag.push_str(&STANDARD_NO_PAD.encode(length.to_be_bytes()));
    etag.push_str(suffix);
    etag.push('"');
    etag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(length: u64, last_modified: u64) -> ResourceMetadata {
        ResourceMetadata {
            is_directory: false,
            length,
            last_modified: Some(last_modified),
        }
    }

    #[test]
    fn test_mime_type_lookup() {
        assert_eq!(mime_type("/index.html"), Some("text/html"));
        assert_eq!(mime_type("/static/APP.JS"), Some("text/javascript"));
        assert_eq!(mime_type("/style.css.gz"), Some("application/gzip"));
        assert_eq!(mime_type("/README"), None);
        assert_eq!(mime_type("/v1.2/README"), None);
    }

    #[test]
    fn test_charset() {
        assert_eq!(charset("text/html; charset=UTF-8"), Some("UTF-8".to_string()));
        assert_eq!(charset("text/plain;Charset=\"iso-8859-1\""), Some("iso-8859-1".to_string()));
        assert_eq!(charset("text/html"), None);
    }

    #[test]
    fn test_http_date() {
        assert_eq!(
            http_date(784_111_777_000).as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
    }

    #[test]
    fn test_weak_etag_shape() {
        let etag = weak_etag("/a.txt", &meta(10, 1000), "");
        assert!(etag.starts_with("W/\""));
        assert!(etag.ends_with('"'));

        let gz = weak_etag("/a.txt", &meta(10, 1000), "--gzip");
        assert_eq!(gz, format!("{}--gzip\"", &etag[..etag.len() - 1]));
    }

    #[test]
    fn test_weak_etag_changes_with_metadata() {
        let a = weak_etag("/a.txt", &meta(10, 1000), "");
        assert_ne!(a, weak_etag("/a.txt", &meta(11, 1000), ""));
        assert_ne!(a, weak_etag("/a.txt", &meta(10, 1001), ""));
        assert_ne!(a, weak_etag("/b.txt", &meta(10, 1000), ""));
        assert_eq!(a, weak_etag("/a.txt", &meta(10, 1000), ""));
    }
}
