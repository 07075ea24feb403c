//! Store configuration.

use crate::format::FRACTION_SIZE;
use crate::{Error, Result};

/// Default capacity of a single chunk file (200 MiB).
pub const DEFAULT_WRITE_CHUNK_SIZE: u64 = 200 * 1024 * 1024;

/// Default number of read cache lines.
pub const DEFAULT_CACHE_LINES: usize = 8;

/// Tunables for a packed store.
///
/// # Example
///
/// ```
/// use vpkstore::StoreConfig;
///
/// let config = StoreConfig::default().with_write_chunk_size(64 * 1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StoreConfig {
    /// Maximum number of payload bytes per chunk file.
    pub write_chunk_size: u64,
    /// Number of 1 MiB lines held by the read cache.
    pub cache_lines: usize,
    /// Store payloads inside the directory file instead of chunk files.
    pub embed_chunk: bool,
    /// Upper bound on per-file preload bytes kept in the directory.
    pub max_preload_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
            cache_lines: DEFAULT_CACHE_LINES,
            embed_chunk: false,
            max_preload_size: u16::MAX as usize,
        }
    }
}

impl StoreConfig {
    /// Set the chunk file capacity.
    pub fn with_write_chunk_size(mut self, size: u64) -> Self {
        self.write_chunk_size = size;
        self
    }

    /// Set the number of read cache lines.
    pub fn with_cache_lines(mut self, lines: usize) -> Self {
        self.cache_lines = lines;
        self
    }

    /// Build a single-file store with an embedded chunk.
    pub fn with_embedded_chunk(mut self, embed: bool) -> Self {
        self.embed_chunk = embed;
        self
    }

    /// Set the preload cap.
    pub fn with_max_preload_size(mut self, size: usize) -> Self {
        self.max_preload_size = size;
        self
    }

    /// Check that every field fits the on-disk format.
    pub fn validate(&self) -> Result<()> {
        if self.write_chunk_size == 0 || self.write_chunk_size > u32::MAX as u64 {
            return Err(Error::InvalidConfig(format!(
                "write chunk size must be between 1 and {} bytes, got {}",
                u32::MAX,
                self.write_chunk_size
            )));
        }
        if self.cache_lines == 0 {
            return Err(Error::InvalidConfig(
                "read cache needs at least one line".to_string(),
            ));
        }
        if self.max_preload_size > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "preload size is stored as u16, got {}",
                self.max_preload_size
            )));
        }
        Ok(())
    }

    /// Cache memory footprint in bytes when every line is resident.
    pub fn cache_capacity_bytes(&self) -> u64 {
        self.cache_lines as u64 * FRACTION_SIZE
    }
}
