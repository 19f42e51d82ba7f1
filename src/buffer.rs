//! Buffer loading.
//!
//! Resources are read into immutable [`Bytes`]. Every clone of a `Bytes`
//! is a read-only view of the same allocation, which is what lets cached
//! buffers be handed to any number of concurrent writers.

use std::fs::File;
use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};
use memmap2::Mmap;

use crate::resource::Resource;

/// Where a loaded buffer is destined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// General purpose heap buffer.
    Indirect,
    /// A single exact-size allocation intended for zero-copy writes.
    Direct,
}

/// Read the whole resource into memory.
pub fn load(resource: &dyn Resource, length_hint: u64, kind: BufferKind) -> io::Result<Bytes> {
    let mut reader = resource.open()?;
    let capacity = usize::try_from(length_hint)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "resource too large to buffer"))?;

    match kind {
        BufferKind::Indirect => {
            let mut data = Vec::with_capacity(capacity);
            reader.read_to_end(&mut data)?;
            Ok(Bytes::from(data))
        }
        BufferKind::Direct => {
            let mut data = BytesMut::with_capacity(capacity).writer();
            io::copy(&mut reader, &mut data)?;
            Ok(data.into_inner().freeze())
        }
    }
}

/// Map the resource's backing file, if it has one.
///
/// Returns `Ok(None)` for resources that are not file-backed and for empty
/// files, which cannot be mapped portably.
pub fn map(resource: &dyn Resource) -> io::Result<Option<Bytes>> {
    let Some(path) = resource.file_path() else {
        return Ok(None);
    };
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    // SAFETY: cached entries are revalidated against the file's length and
    // modification time on every lookup, and readers only see the mapping
    // through immutable `Bytes`.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(Bytes::from_owner(mmap)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{FileResourceFactory, MemoryResourceFactory, ResourceFactory};
    use std::io::Write;

    #[test]
    fn test_load_indirect_and_direct() {
        let factory = MemoryResourceFactory::new();
        factory.put("/a.txt", "hello world", 1);
        let resource = factory.resource("/a.txt").unwrap();

        let indirect = load(resource.as_ref(), 11, BufferKind::Indirect).unwrap();
        let direct = load(resource.as_ref(), 11, BufferKind::Direct).unwrap();
        assert_eq!(&indirect[..], b"hello world");
        assert_eq!(indirect, direct);
    }

    #[test]
    fn test_load_failure() {
        let factory = MemoryResourceFactory::new();
        factory.put("/a.txt", "hello", 1);
        factory.set_unreadable("/a.txt", true);
        let resource = factory.resource("/a.txt").unwrap();
        assert!(load(resource.as_ref(), 5, BufferKind::Indirect).is_err());
    }

    #[test]
    fn test_map_memory_resource_is_unsupported() {
        let factory = MemoryResourceFactory::new();
        factory.put("/a.txt", "hello", 1);
        let resource = factory.resource("/a.txt").unwrap();
        assert!(map(resource.as_ref()).unwrap().is_none());
    }

    #[test]
    fn test_map_file() {
        let root = std::env::temp_dir().join(format!("static-content-cache-map-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        File::create(root.join("big.bin"))
            .unwrap()
            .write_all(&[7u8; 4096])
            .unwrap();

        let factory = FileResourceFactory::new(&root);
        let resource = factory.resource("/big.bin").unwrap();
        let mapped = map(resource.as_ref()).unwrap().unwrap();
        assert_eq!(mapped.len(), 4096);
        assert!(mapped.iter().all(|b| *b == 7));

        let _ = std::fs::remove_dir_all(&root);
    }
}
