//! On-disk structures of the directory file.
//!
//! A store is one directory file (`<base>_dir.vpk`) plus numbered chunk files
//! (`<base>_000.vpk`, `<base>_001.vpk`, ...). The directory file is laid out as:
//!
//! ```text
//! DirectoryHeader
//! tree                 extension -> path -> filename groups, "" terminated
//! embedded chunk       payload for entries in chunk EMBEDDED_CHUNK
//! chunk hash table     ChunkHashRecord per 1 MiB fraction
//! SelfHashes           directory, chunk-hashes and total MD5
//! signature section    optional, see crate::signing
//! ```

use std::path::{Path, PathBuf};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Granularity of hashing and caching (1 MiB).
pub const FRACTION_SIZE: u64 = 1 << 20;

/// Maximum number of chunk files one store can address.
pub const MAX_CHUNK_FILES: usize = 512;

/// Chunk index that refers to payload embedded in the directory file.
pub const EMBEDDED_CHUNK: u16 = 0x7FFF;

/// Terminates the part list of a tree entry.
pub const PART_TERMINATOR: u16 = 0xFFFF;

/// Placeholder written for an empty extension or root path.
pub const EMPTY_NAME: &str = " ";

/// Directory file header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct DirectoryHeader {
    /// Magic, always [`DirectoryHeader::SIGNATURE`]
    pub signature: u32,
    /// Format version
    pub version: u32,
    /// Size of the tree section
    pub tree_size: u32,
    /// Size of the embedded chunk section
    pub embedded_size: u32,
    /// Size of the chunk hash table
    pub chunk_hashes_size: u32,
    /// Size of the self hashes section
    pub self_hashes_size: u32,
    /// Size of the signature section
    pub signature_size: u32,
}

impl DirectoryHeader {
    /// Directory signature as u32.
    pub const SIGNATURE: u32 = 0x55AA1234;

    /// Supported format version.
    pub const VERSION: u32 = 2;

    /// Encoded header size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Number of bytes covered by the signature.
    ///
    /// Everything before the signature section is signed.
    pub fn signed_size(&self) -> u64 {
        Self::SIZE as u64
            + self.tree_size as u64
            + self.embedded_size as u64
            + self.chunk_hashes_size as u64
            + self.self_hashes_size as u64
    }
}

/// One row of the chunk hash table.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct ChunkHashRecord {
    /// Chunk file index
    pub chunk: u32,
    /// Fraction index within the chunk
    pub fraction: u32,
    /// Number of bytes hashed
    pub length: u32,
    /// MD5 of the fraction
    pub md5: [u8; 16],
}

impl ChunkHashRecord {
    /// Encoded record size.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Directory-level digests.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct SelfHashes {
    /// MD5 of the tree section
    pub directory_md5: [u8; 16],
    /// MD5 of the chunk hash table
    pub chunk_hashes_md5: [u8; 16],
    /// MD5 of the two digests above
    pub total_md5: [u8; 16],
}

impl SelfHashes {
    /// Encoded section size.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// File names of a store on disk.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use vpkstore::StorePaths;
///
/// let paths = StorePaths::from_dir_path("content/pak01_dir.vpk");
/// assert_eq!(paths.dir_path(), Path::new("content/pak01_dir.vpk"));
/// assert_eq!(paths.chunk_path(3), Path::new("content/pak01_003.vpk"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    base: PathBuf,
}

impl StorePaths {
    /// Derive chunk names from the directory file path.
    ///
    /// `pak01_dir.vpk` and `pak01.vpk` both use `pak01` as the base name.
    pub fn from_dir_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("pak01");

        let base_name = file_name
            .strip_suffix("_dir.vpk")
            .or_else(|| file_name.strip_suffix(".vpk"))
            .unwrap_or(file_name);

        Self {
            base: path.with_file_name(base_name),
        }
    }

    /// Path of the directory file.
    pub fn dir_path(&self) -> PathBuf {
        self.with_suffix("_dir.vpk")
    }

    /// Path of a numbered chunk file.
    pub fn chunk_path(&self, chunk: u16) -> PathBuf {
        self.with_suffix(&format!("_{chunk:03}.vpk"))
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }
}
