//! Open file handles.

use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;

use crate::entry::FileDescriptor;
use crate::store::PackedStore;

/// A cursor over one stored file.
///
/// Handles are cheap to copy and borrow the store, so any number of them
/// can read concurrently from different threads.
#[derive(Clone, Copy)]
pub struct VpkHandle<'a> {
    store: &'a PackedStore,
    entry: &'a FileDescriptor,
    position: u64,
}

impl std::fmt::Debug for VpkHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpkHandle")
            .field("chunk", &self.chunk())
            .field("size", &self.size())
            .field("position", &self.position)
            .finish()
    }
}

impl<'a> VpkHandle<'a> {
    pub(crate) fn new(store: &'a PackedStore, entry: &'a FileDescriptor) -> Self {
        Self {
            store,
            entry,
            position: 0,
        }
    }

    /// Total content size.
    #[inline]
    pub fn size(&self) -> u64 {
        self.entry.size()
    }

    /// Current cursor.
    #[inline]
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Move the cursor, clamped to the file size.
    pub fn seek_to(&mut self, position: u64) -> u64 {
        self.position = position.min(self.size());
        self.position
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.size() - self.position
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        self.position >= self.size()
    }

    /// Stored CRC32C of the full content.
    #[inline]
    pub fn crc(&self) -> u32 {
        self.entry.crc()
    }

    /// Bytes kept inline in the directory.
    #[inline]
    pub fn preload(&self) -> &'a [u8] {
        self.entry.preload()
    }

    /// Chunk holding the first non-preload byte.
    #[inline]
    pub fn chunk(&self) -> Option<u16> {
        self.entry.first_chunk()
    }

    /// Byte range of the first part inside its chunk.
    pub fn range(&self) -> Option<Range<u64>> {
        self.entry.parts().first().map(|p| p.offset as u64..p.end())
    }

    /// Full descriptor.
    #[inline]
    pub fn descriptor(&self) -> &'a FileDescriptor {
        self.entry
    }

    /// Read into `buf` and advance. Returns 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.store.read_at(self.entry, self.position, buf);
        self.position += n as u64;
        n
    }
}

impl Read for VpkHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(VpkHandle::read(self, buf))
    }
}

impl Seek for VpkHandle<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
            SeekFrom::End(d) => self.size().checked_add_signed(d),
        };
        match target {
            Some(t) => Ok(self.seek_to(t)),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            )),
        }
    }
}
