//! CRC32C keys and checksums.
//!
//! The directory index is keyed by the CRC32C of each normalized path, and
//! every entry records the CRC32C of its full contents.

/// Index key of a normalized logical path.
#[inline]
pub fn path_key(normalized: &str) -> u32 {
    crc32c::crc32c(normalized.as_bytes())
}

/// Checksum of a complete file body.
#[inline]
pub fn content_crc(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Incremental content checksum for files read piece by piece.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentCrc {
    state: u32,
}

impl ContentCrc {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, data);
    }

    pub fn finish(self) -> u32 {
        self.state
    }
}
