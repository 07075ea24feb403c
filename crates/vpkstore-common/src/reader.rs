//! Cursor over a borrowed directory image.
//!
//! [`BinaryReader`] walks the little-endian records of a directory file
//! (tree strings, entry headers, hash tables, signature blocks) and hands out
//! slices of the original buffer.

use zerocopy::FromBytes;

use crate::{Error, Result};

/// Little-endian reader over a byte slice.
///
/// # Example
///
/// ```
/// use vpkstore_common::BinaryReader;
///
/// let data = [0x34, 0x12, 0xAA, 0x55, b'v', b'p', b'k', 0];
/// let mut reader = BinaryReader::new(&data);
///
/// assert_eq!(reader.read_u32().unwrap(), 0x55AA1234);
/// assert_eq!(reader.read_cstring().unwrap(), "vpk");
/// assert!(reader.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> BinaryReader<'a> {
    #[inline]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    /// Bytes left after the cursor.
    #[inline]
    pub const fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.cursor)
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything after the cursor, without consuming it.
    #[inline]
    pub fn remaining_bytes(&self) -> &'a [u8] {
        self.data.get(self.cursor..).unwrap_or_default()
    }

    /// The next `count` bytes, without consuming them.
    pub fn peek_bytes(&self, count: usize) -> Result<&'a [u8]> {
        self.remaining_bytes()
            .get(..count)
            .ok_or(Error::UnexpectedEof {
                needed: count,
                available: self.remaining(),
            })
    }

    /// Consume the next `count` bytes.
    #[inline]
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let bytes = self.peek_bytes(count)?;
        self.cursor += count;
        Ok(bytes)
    }

    fn read_le<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_le().map(u16::from_le_bytes)
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_le().map(u32::from_le_bytes)
    }

    /// Consume a NUL-terminated UTF-8 string. The terminator is skipped.
    pub fn read_cstring(&mut self) -> Result<&'a str> {
        let rest = self.remaining_bytes();
        let end = memchr::memchr(0, rest).ok_or(Error::MissingNullTerminator)?;
        self.cursor += end + 1;
        Ok(std::str::from_utf8(&rest[..end])?)
    }

    /// Decode a fixed-layout record.
    pub fn read_struct<T: FromBytes>(&mut self) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let bytes = self.read_bytes(size)?;
        T::read_from_bytes(bytes).map_err(|_| Error::UnexpectedEof {
            needed: size,
            available: bytes.len(),
        })
    }
}
