//! Little-endian binary writer.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use zerocopy::{Immutable, IntoBytes};

use crate::{Error, Result};

/// A counting little-endian writer over any [`Write`] sink.
///
/// # Example
///
/// ```
/// use vpkstore_common::BinaryWriter;
///
/// let mut writer = BinaryWriter::new(Vec::new());
/// writer.write_u16(0xFFFF).unwrap();
/// writer.write_cstring("vmt").unwrap();
///
/// assert_eq!(writer.written(), 6);
/// assert_eq!(writer.into_inner(), vec![0xFF, 0xFF, b'v', b'm', b't', 0]);
/// ```
#[derive(Debug)]
pub struct BinaryWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> BinaryWriter<W> {
    /// Wrap a sink.
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Unwrap the sink.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write a little-endian u16.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.inner.write_u16::<LittleEndian>(value)?;
        self.written += 2;
        Ok(())
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.inner.write_u32::<LittleEndian>(value)?;
        self.written += 4;
        Ok(())
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Write a string followed by a null terminator.
    pub fn write_cstring(&mut self, s: &str) -> Result<()> {
        if memchr::memchr(0, s.as_bytes()).is_some() {
            return Err(Error::InteriorNull(s.to_string()));
        }
        self.write_bytes(s.as_bytes())?;
        self.write_bytes(&[0])
    }

    /// Write a zerocopy struct verbatim.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, value: &T) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BinaryReader;

    #[test]
    fn test_counts_bytes() {
        let mut writer = BinaryWriter::new(Vec::new());
        writer.write_u32(7).unwrap();
        writer.write_u16(9).unwrap();
        writer.write_bytes(b"abc").unwrap();
        assert_eq!(writer.written(), 9);
        assert_eq!(writer.into_inner().len(), 9);
    }

    #[test]
    fn test_interior_null_rejected() {
        let mut writer = BinaryWriter::new(Vec::new());
        assert!(matches!(
            writer.write_cstring("a\0b"),
            Err(Error::InteriorNull(_))
        ));
        assert_eq!(writer.written(), 0);
    }

    #[test]
    fn test_reader_understands_writer_layout() {
        let mut writer = BinaryWriter::new(Vec::new());
        writer.write_cstring("models").unwrap();
        writer.write_u16(3).unwrap();
        let bytes = writer.into_inner();

        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_cstring().unwrap(), "models");
        assert_eq!(reader.read_u16().unwrap(), 3);
    }
}
