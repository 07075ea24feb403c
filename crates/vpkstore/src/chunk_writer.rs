//! Appends payload bytes to numbered chunk files.

use std::fs::{File, OpenOptions};
use std::io::Write;

use tracing::{debug, info};

use crate::entry::FilePart;
use crate::format::{StorePaths, MAX_CHUNK_FILES};
use crate::{Error, Result};

struct OpenChunk {
    index: u16,
    file: File,
    len: u64,
}

/// Writer for the chunk file currently being filled.
///
/// Chunks are filled up to `limit` bytes and then rotated. A store reopened
/// for appending continues its last chunk while it has room.
pub(crate) struct ChunkWriter {
    paths: StorePaths,
    limit: u64,
    current: Option<OpenChunk>,
    next: u16,
    resume: Option<u16>,
}

impl ChunkWriter {
    /// Writer for a store with `chunk_count` existing chunk files.
    pub fn new(paths: StorePaths, limit: u64, chunk_count: u16) -> Self {
        Self {
            paths,
            limit,
            current: None,
            next: chunk_count,
            resume: chunk_count.checked_sub(1),
        }
    }

    /// Bytes that still fit into the open chunk.
    pub fn remaining(&mut self) -> Result<u64> {
        self.try_resume()?;
        Ok(self
            .current
            .as_ref()
            .map_or(0, |c| self.limit.saturating_sub(c.len)))
    }

    fn try_resume(&mut self) -> Result<()> {
        let Some(index) = self.resume.take() else {
            return Ok(());
        };

        let path = self.paths.chunk_path(index);
        let file = match OpenOptions::new().append(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < self.limit {
            debug!(chunk = index, len, "resuming chunk file");
            self.current = Some(OpenChunk { index, file, len });
        }
        Ok(())
    }

    /// Close the open chunk and start the next one.
    pub fn rotate(&mut self) -> Result<u16> {
        self.try_resume()?;
        let index = self.next;
        if index as usize >= MAX_CHUNK_FILES {
            return Err(Error::TooManyChunkFiles(index as usize));
        }

        let path = self.paths.chunk_path(index);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        info!(chunk = index, path = %path.display(), "starting chunk file");

        self.current = Some(OpenChunk {
            index,
            file,
            len: 0,
        });
        self.next = index + 1;
        Ok(index)
    }

    /// Append to the open chunk, starting one if none is open.
    ///
    /// The caller keeps `data` within [`ChunkWriter::remaining`].
    pub fn append(&mut self, data: &[u8]) -> Result<FilePart> {
        self.try_resume()?;
        if self.current.is_none() {
            self.rotate()?;
        }
        let chunk = self
            .current
            .as_mut()
            .ok_or_else(|| Error::InvalidConfig("no chunk file open".to_string()))?;

        let offset = u32::try_from(chunk.len).map_err(|_| Error::PayloadTooLarge {
            size: chunk.len,
            limit: u32::MAX as u64,
        })?;
        let length = u32::try_from(data.len()).map_err(|_| Error::PayloadTooLarge {
            size: data.len() as u64,
            limit: u32::MAX as u64,
        })?;

        chunk.file.write_all(data)?;
        chunk.len += data.len() as u64;

        Ok(FilePart {
            chunk: chunk.index,
            offset,
            length,
        })
    }

    /// Flush the open chunk to disk.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(chunk) = self.current.as_mut() {
            chunk.file.flush()?;
            chunk.file.sync_data()?;
        }
        Ok(())
    }
}
