//! Per-chunk file handle tracking.

use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::io::{read_full, ChunkFile, FileProvider};

struct TrackerState {
    file: Option<Box<dyn ChunkFile>>,
    position: u64,
}

/// Owns the OS handle of one chunk file.
///
/// The handle opens on first use and remembers its cursor so sequential
/// reads skip the seek. The lock serializes seek+read pairs on this chunk
/// only; other chunks have their own tracker.
pub(crate) struct FileTracker {
    chunk: u16,
    path: PathBuf,
    state: Mutex<TrackerState>,
}

impl FileTracker {
    pub fn new(chunk: u16, path: PathBuf) -> Self {
        Self {
            chunk,
            path,
            state: Mutex::new(TrackerState {
                file: None,
                position: 0,
            }),
        }
    }

    /// Positioned read. Returns fewer bytes only at end of file.
    pub fn read_at(
        &self,
        provider: &dyn FileProvider,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let mut state = self.state.lock();

        if state.file.is_none() {
            debug!(chunk = self.chunk, path = %self.path.display(), "opening chunk file");
            state.file = Some(provider.open(&self.path)?);
            state.position = 0;
        }

        let result = Self::seek_and_read(&mut state, offset, buf);
        match result {
            Ok(n) => {
                state.position = offset + n as u64;
                Ok(n)
            }
            Err(e) => {
                // Reopen on next access; the cursor is unknown now.
                state.file = None;
                Err(e)
            }
        }
    }

    fn seek_and_read(state: &mut TrackerState, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let position = state.position;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        if position != offset {
            trace!(from = position, to = offset, "seeking chunk file");
            file.seek_to(offset)?;
        }
        read_full(file.as_mut(), buf)
    }

    /// Drop the OS handle. The next read reopens it.
    #[cfg(test)]
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.file = None;
        state.position = 0;
    }

    /// Whether the OS handle is currently open.
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }
}
