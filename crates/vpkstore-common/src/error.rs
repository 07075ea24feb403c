//! Encoding and decoding errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A record ran past the end of the buffer.
    #[error("truncated record: needed {needed} bytes, {available} left")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tree string is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("tree string has no NUL terminator")]
    MissingNullTerminator,

    /// Names are NUL-terminated on disk, so they cannot contain NUL.
    #[error("name contains a NUL byte: {0:?}")]
    InteriorNull(String),
}

pub type Result<T> = std::result::Result<T, Error>;
