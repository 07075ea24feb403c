//! In-memory collaborators for unit tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::io::{ChunkFile, FileProvider};

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    reads: AtomicUsize,
    seeks: AtomicUsize,
}

/// Provider over in-memory files that counts every operation.
#[derive(Default)]
pub(crate) struct MemoryProvider {
    files: Mutex<FxHashMap<PathBuf, Arc<[u8]>>>,
    counters: Arc<Counters>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: Into<PathBuf>>(&self, path: P, data: Vec<u8>) {
        self.files.lock().insert(path.into(), data.into());
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    pub fn seeks(&self) -> usize {
        self.counters.seeks.load(Ordering::SeqCst)
    }
}

impl FileProvider for MemoryProvider {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ChunkFile>> {
        let data = self
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryFile {
            data,
            position: 0,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MemoryFile {
    data: Arc<[u8]>,
    position: usize,
    counters: Arc<Counters>,
}

impl ChunkFile for MemoryFile {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.counters.seeks.fetch_add(1, Ordering::SeqCst);
        self.position = offset as usize;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let start = self.position.min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n;
        Ok(n)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// Deterministic content where every byte differs from its neighbours.
pub(crate) fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}
