//! Resource access.
//!
//! The cache never touches the file system directly. It asks a
//! [`ResourceFactory`] for a [`Resource`] handle per path and reads metadata
//! and bytes through it. Two factories are provided: [`FileResourceFactory`]
//! serves a directory tree, [`MemoryResourceFactory`] serves mutable
//! in-memory files.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::{Buf, Bytes};
use dashmap::DashMap;

use crate::error::{CacheError, CacheResult};
use crate::headers;

/// Metadata of an existing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceMetadata {
    /// Whether the resource is a directory.
    pub is_directory: bool,
    /// Length in bytes.
    pub length: u64,
    /// Last modification, in milliseconds since the Unix epoch.
    pub last_modified: Option<u64>,
}

/// A handle to one underlying resource.
pub trait Resource: Send + Sync + fmt::Debug {
    /// A name identifying the resource, used for content-type lookup and
    /// etag derivation.
    fn name(&self) -> &str;

    /// Read live metadata. `Ok(None)` means the resource does not exist.
    fn metadata(&self) -> io::Result<Option<ResourceMetadata>>;

    /// Open a reader over the resource's bytes.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// The backing file, if the resource can be memory-mapped.
    fn file_path(&self) -> Option<&Path> {
        None
    }

    /// Release the handle. Called once by the cache when an entry is
    /// invalidated.
    fn close(&self) {}

    /// Weak etag for the given metadata snapshot.
    fn weak_etag(&self, metadata: &ResourceMetadata, suffix: &str) -> String {
        headers::weak_etag(self.name(), metadata, suffix)
    }

    fn exists(&self) -> bool {
        matches!(self.metadata(), Ok(Some(_)))
    }

    fn is_directory(&self) -> bool {
        matches!(self.metadata(), Ok(Some(m)) if m.is_directory)
    }

    fn length(&self) -> u64 {
        match self.metadata() {
            Ok(Some(m)) => m.length,
            _ => 0,
        }
    }

    fn last_modified(&self) -> Option<u64> {
        match self.metadata() {
            Ok(Some(m)) => m.last_modified,
            _ => None,
        }
    }
}

/// Maps request paths onto resources.
pub trait ResourceFactory: Send + Sync + fmt::Debug {
    /// Resolve `path`. The returned handle may refer to a resource that does
    /// not exist; callers check [`Resource::metadata`].
    fn resource(&self, path: &str) -> CacheResult<Arc<dyn Resource>>;
}

/// Serves files below a root directory.
#[derive(Debug, Clone)]
pub struct FileResourceFactory {
    root: PathBuf,
}

impl FileResourceFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceFactory for FileResourceFactory {
    fn resource(&self, path: &str) -> CacheResult<Arc<dyn Resource>> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut full = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                _ => return Err(CacheError::InvalidPath(path.to_string())),
            }
        }
        Ok(Arc::new(FileResource::new(full)))
    }
}

/// A file on disk.
#[derive(Debug)]
pub struct FileResource {
    path: PathBuf,
    name: String,
}

impl FileResource {
    pub fn new(path: PathBuf) -> Self {
        let name = path.to_string_lossy().into_owned();
        Self { path, name }
    }
}

impl Resource for FileResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> io::Result<Option<ResourceMetadata>> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        Ok(Some(ResourceMetadata {
            is_directory: meta.is_dir(),
            length: meta.len(),
            last_modified,
        }))
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn file_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Bytes,
    last_modified: u64,
    directory: bool,
    unreadable: bool,
}

/// An in-memory resource tree whose files can be replaced at any time.
///
/// Handles read the live state on every call, so changing a file is
/// observed by entries that were cached earlier.
#[derive(Debug, Clone, Default)]
pub struct MemoryResourceFactory {
    files: Arc<DashMap<String, MemoryFile>>,
    closed: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

impl MemoryResourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn put(&self, path: impl Into<String>, data: impl Into<Bytes>, last_modified: u64) {
        self.files.insert(
            path.into(),
            MemoryFile {
                data: data.into(),
                last_modified,
                directory: false,
                unreadable: false,
            },
        );
    }

    /// Add or replace a directory.
    pub fn put_directory(&self, path: impl Into<String>, last_modified: u64) {
        self.files.insert(
            path.into(),
            MemoryFile {
                data: Bytes::new(),
                last_modified,
                directory: true,
                unreadable: false,
            },
        );
    }

    /// Make reads of `path` fail while keeping its metadata intact.
    pub fn set_unreadable(&self, path: &str, unreadable: bool) {
        if let Some(mut file) = self.files.get_mut(path) {
            file.unreadable = unreadable;
        }
    }

    pub fn remove(&self, path: &str) {
        self.files.remove(path);
    }

    /// Number of handles closed so far.
    pub fn closed_handles(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of successful `open` calls so far.
    pub fn opened_streams(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl ResourceFactory for MemoryResourceFactory {
    fn resource(&self, path: &str) -> CacheResult<Arc<dyn Resource>> {
        Ok(Arc::new(MemoryResource {
            path: path.to_string(),
            files: Arc::clone(&self.files),
            closed: Arc::clone(&self.closed),
            opened: Arc::clone(&self.opened),
        }))
    }
}

/// A handle into a [`MemoryResourceFactory`].
#[derive(Debug)]
pub struct MemoryResource {
    path: String,
    files: Arc<DashMap<String, MemoryFile>>,
    closed: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

impl Resource for MemoryResource {
    fn name(&self) -> &str {
        &self.path
    }

    fn metadata(&self) -> io::Result<Option<ResourceMetadata>> {
        Ok(self.files.get(&self.path).map(|file| ResourceMetadata {
            is_directory: file.directory,
            length: file.data.len() as u64,
            last_modified: Some(file.last_modified),
        }))
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        let data = match self.files.get(&self.path) {
            Some(file) if file.unreadable => {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "unreadable"))
            }
            Some(file) if !file.directory => file.data.clone(),
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, self.path.clone())),
        };
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(data.reader()))
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
