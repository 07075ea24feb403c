//! File provider contract and the filesystem implementation.
//!
//! The store never touches chunk files directly on the read path; it asks a
//! [`FileProvider`] for a [`ChunkFile`] and drives it through a
//! [`FileTracker`](crate::tracker::FileTracker).

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A seekable, readable file opened by a [`FileProvider`].
pub trait ChunkFile: Send {
    /// Move the OS-level cursor to an absolute offset.
    fn seek_to(&mut self, offset: u64) -> io::Result<()>;

    /// Read at the current cursor, advancing it.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Current file length.
    fn len(&self) -> io::Result<u64>;
}

impl ChunkFile for File {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn len(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }
}

/// Opens files by name for reading.
///
/// Providers are read-only. Chunk appends and directory writes go straight to
/// the local filesystem at the store's own paths.
pub trait FileProvider: Send + Sync {
    /// Open a file for reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn ChunkFile>>;

    /// Read a whole file.
    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut file = self.open(path)?;
        let len = file.len()?;
        let mut data = vec![0u8; len as usize];
        let n = read_full(file.as_mut(), &mut data)?;
        data.truncate(n);
        Ok(data)
    }

    /// Size of a file.
    fn size(&self, path: &Path) -> io::Result<u64> {
        self.open(path)?.len()
    }
}

/// Read until `buf` is full or the file ends.
pub fn read_full(file: &mut dyn ChunkFile, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Replace `path` with `bytes` so readers see either the old file or the new one.
///
/// The data goes to a sibling temp file, is synced, then renamed over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&temp_path, path).map_err(|e| {
        std::fs::remove_file(&temp_path).ok();
        e
    })
}

/// Filesystem provider with optional search paths.
///
/// Relative paths are tried against each search path in order; absolute
/// paths, or any path when no search paths are set, open directly.
#[derive(Debug, Clone, Default)]
pub struct FsFileProvider {
    search_paths: Vec<PathBuf>,
}

impl FsFileProvider {
    /// Provider that opens paths as given.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory to resolve relative paths against.
    pub fn with_search_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.search_paths.push(path.into());
        self
    }

    fn resolve(&self, path: &Path) -> io::Result<File> {
        if path.is_absolute() || self.search_paths.is_empty() {
            return File::open(path);
        }

        let mut last_err = None;
        for root in &self.search_paths {
            match File::open(root.join(path)) {
                Ok(file) => return Ok(file),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
    }
}

impl FileProvider for FsFileProvider {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ChunkFile>> {
        Ok(Box::new(self.resolve(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pak_dir.vpk");
        std::fs::write(&path, b"old directory").unwrap();

        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert!(!dir.path().join("pak_dir.vpk.tmp").exists());

        let missing = dir.path().join("no/such/dir_dir.vpk");
        assert!(write_atomic(&missing, b"x").is_err());
    }

    #[test]
    fn test_read_all_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"packed bytes").unwrap();

        let provider = FsFileProvider::new();
        assert_eq!(provider.read_all(&path).unwrap(), b"packed bytes");
        assert_eq!(provider.size(&path).unwrap(), 12);
    }

    #[test]
    fn test_search_paths() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("only_here.bin"), b"x").unwrap();

        let provider = FsFileProvider::new()
            .with_search_path(first.path())
            .with_search_path(second.path());

        assert_eq!(provider.read_all(Path::new("only_here.bin")).unwrap(), b"x");
        assert_eq!(
            provider.open(Path::new("missing.bin")).err().map(|e| e.kind()),
            Some(io::ErrorKind::NotFound)
        );
    }

    #[test]
    fn test_seek_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        std::fs::write(&path, (0u8..100).collect::<Vec<_>>()).unwrap();

        let mut file = FsFileProvider::new().open(&path).unwrap();
        file.seek_to(90).unwrap();
        let mut buf = [0u8; 32];
        let n = read_full(file.as_mut(), &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(buf[0], 90);
    }
}
