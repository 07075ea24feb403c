//! Packed-content archive store.
//!
//! A store multiplexes many small named files into a few large chunk files
//! and keeps a directory that maps each normalized path to its bytes. It
//! supports:
//!
//! - O(log n) lookup through a CRC32C-keyed sorted index
//! - Inline preload bytes and multi-chunk entries
//! - A two-level MD5 hash tree over 1 MiB chunk fractions
//! - Optional Ed25519 signatures over the directory file
//! - A bounded LRU read cache with out-of-band verification
//!
//! # Example
//!
//! ```no_run
//! use vpkstore::{PackedStore, StoreConfig};
//!
//! let store = PackedStore::open("pak01_dir.vpk", StoreConfig::default())?;
//!
//! for name in store.get_file_list(Some("*.mdl"))? {
//!     let data = store.read_file(&name).unwrap_or_default();
//!     println!("{name}: {} bytes", data.len());
//! }
//!
//! // Background verification is reconciled by a periodic tick.
//! store.service();
//! println!("{}", store.pack_file_load_error_summary());
//! # Ok::<(), vpkstore::Error>(())
//! ```

mod cache;
mod chunk_writer;
mod config;
mod directory;
mod entry;
mod error;
mod format;
mod handle;
mod hasher;
mod hashing;
mod io;
mod listing;
mod signing;
mod stats;
mod store;
mod tracker;

pub mod path;

#[cfg(test)]
mod testing;

pub use config::{StoreConfig, DEFAULT_CACHE_LINES, DEFAULT_WRITE_CHUNK_SIZE};
pub use entry::{FileDescriptor, FilePart};
pub use error::{Error, Result};
pub use format::{StorePaths, EMBEDDED_CHUNK, FRACTION_SIZE, MAX_CHUNK_FILES};
pub use handle::VpkHandle;
pub use hasher::{HashDispatcher, HashRequest, ImmediateHasher, ThreadPoolHasher};
pub use hashing::{ChunkHashFraction, DirectoryHashes};
pub use io::{read_full, ChunkFile, FileProvider, FsFileProvider};
pub use listing::FileAndDirLists;
pub use signing::{SignatureCheck, SigningKeys, KEY_SIZE};
pub use stats::CacheStats;
pub use store::{AddFileResult, PackedStore};

pub use vpkstore_common::Md5Digest;
