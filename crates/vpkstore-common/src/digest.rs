//! MD5 digests for the fraction hash tree.

use std::fmt;

/// A 16-byte MD5 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Md5Digest(pub [u8; 16]);

impl Md5Digest {
    /// Size of a digest in bytes.
    pub const SIZE: usize = 16;

    /// The all-zero digest, used for hashes that have not been computed.
    pub const ZERO: Self = Self([0u8; 16]);

    /// Hash a byte slice.
    #[inline]
    pub fn compute(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    /// Raw digest bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether this is the all-zero placeholder.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Digest({self})")
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Incremental MD5 computation.
pub struct Md5Context(md5::Context);

impl Md5Context {
    /// Start a new digest.
    pub fn new() -> Self {
        Self(md5::Context::new())
    }

    /// Feed more bytes.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.0.consume(data);
    }

    /// Finish and return the digest.
    pub fn finish(self) -> Md5Digest {
        Md5Digest(self.0.compute().0)
    }
}

impl Default for Md5Context {
    fn default() -> Self {
        Self::new()
    }
}
