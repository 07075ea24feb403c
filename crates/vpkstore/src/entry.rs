//! Content file descriptors.

use crate::format::EMBEDDED_CHUNK;

/// A contiguous run of a file's bytes inside one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePart {
    /// Chunk file index, or [`EMBEDDED_CHUNK`].
    pub chunk: u16,
    /// Byte offset within the chunk.
    pub offset: u32,
    /// Number of bytes.
    pub length: u32,
}

impl FilePart {
    /// End offset (exclusive) within the chunk.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }

    /// Whether the part lives inside the directory file.
    #[inline]
    pub fn is_embedded(&self) -> bool {
        self.chunk == EMBEDDED_CHUNK
    }
}

/// Where a file's content lives and how to check it.
///
/// The first `preload().len()` bytes are kept in the directory itself; the
/// remainder is the concatenation of [`FilePart`]s, normally a single one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    crc: u32,
    preload: Vec<u8>,
    parts: Vec<FilePart>,
}

impl FileDescriptor {
    /// Create a descriptor.
    pub fn new(crc: u32, preload: Vec<u8>, parts: Vec<FilePart>) -> Self {
        Self {
            crc,
            preload,
            parts,
        }
    }

    /// CRC32C of the full content.
    #[inline]
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Inline preload bytes.
    #[inline]
    pub fn preload(&self) -> &[u8] {
        &self.preload
    }

    /// Chunk-resident parts in content order.
    #[inline]
    pub fn parts(&self) -> &[FilePart] {
        &self.parts
    }

    /// Total content size.
    pub fn size(&self) -> u64 {
        self.preload.len() as u64 + self.chunk_size()
    }

    /// Bytes stored outside the directory.
    pub fn chunk_size(&self) -> u64 {
        self.parts.iter().map(|p| p.length as u64).sum()
    }

    /// Chunk holding the first chunk-resident byte.
    pub fn first_chunk(&self) -> Option<u16> {
        self.parts.first().map(|p| p.chunk)
    }

    /// Whether content spans more than one chunk.
    pub fn is_multichunk(&self) -> bool {
        self.parts.len() > 1
    }

    /// Locate a chunk-data offset: returns the part and the offset inside it.
    pub(crate) fn locate(&self, chunk_offset: u64) -> Option<(&FilePart, u64)> {
        let mut start = 0u64;
        for part in &self.parts {
            let len = part.length as u64;
            if chunk_offset < start + len {
                return Some((part, chunk_offset - start));
            }
            start += len;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_descriptor() -> FileDescriptor {
        FileDescriptor::new(
            0xDEADBEEF,
            vec![1, 2, 3],
            vec![
                FilePart { chunk: 0, offset: 900, length: 100 },
                FilePart { chunk: 1, offset: 0, length: 50 },
            ],
        )
    }

    #[test]
    fn test_sizes() {
        let desc = split_descriptor();
        assert_eq!(desc.size(), 153);
        assert_eq!(desc.chunk_size(), 150);
        assert_eq!(desc.first_chunk(), Some(0));
        assert!(desc.is_multichunk());
    }

    #[test]
    fn test_locate() {
        let desc = split_descriptor();
        let (part, inner) = desc.locate(0).unwrap();
        assert_eq!((part.chunk, inner), (0, 0));
        let (part, inner) = desc.locate(99).unwrap();
        assert_eq!((part.chunk, inner), (0, 99));
        let (part, inner) = desc.locate(100).unwrap();
        assert_eq!((part.chunk, inner), (1, 0));
        assert!(desc.locate(150).is_none());
    }

    #[test]
    fn test_preload_only() {
        let desc = FileDescriptor::new(1, vec![9; 10], Vec::new());
        assert_eq!(desc.size(), 10);
        assert_eq!(desc.first_chunk(), None);
        assert!(desc.locate(0).is_none());
    }
}
