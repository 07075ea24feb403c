//! Common utilities for vpkstore.
//!
//! Byte-level building blocks shared by the store and its tooling:
//!
//! - [`BinaryReader`] - Zero-copy binary reading from byte slices
//! - [`BinaryWriter`] - Little-endian serialization into a growable buffer
//! - [`crc`] - CRC32C hashing of logical paths and file contents
//! - [`digest`] - MD5 digests used by the fraction hash tree

mod error;
mod reader;
mod writer;

pub mod crc;
pub mod digest;

pub use digest::{Md5Context, Md5Digest};
pub use error::{Error, Result};
pub use reader::BinaryReader;
pub use writer::BinaryWriter;
