//! Error types for the packed store.

use thiserror::Error;

/// Errors that can occur when building, loading or writing a packed store.
///
/// Read-path failures (chunk I/O, hash mismatches) never surface here; they
/// are absorbed by the read cache and reported through the load error summary.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Common library error.
    #[error("{0}")]
    Common(#[from] vpkstore_common::Error),

    /// Directory header magic did not match.
    #[error("invalid directory magic: expected {expected:#010x}, got {actual:#010x}")]
    InvalidMagic { expected: u32, actual: u32 },

    /// Unsupported directory version.
    #[error("unsupported directory version: {0}")]
    UnsupportedVersion(u32),

    /// Directory bytes are structurally invalid.
    #[error("malformed directory: {0}")]
    MalformedDirectory(String),

    /// Logical path cannot be stored.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// Two distinct paths map to the same directory key.
    #[error("path hash collision: {path:?} and {existing:?} both hash to {hash:#010x}")]
    PathHashCollision {
        path: String,
        existing: String,
        hash: u32,
    },

    /// Payload larger than the write-chunk size with splitting disallowed.
    #[error("payload of {size} bytes exceeds write chunk size of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// Preload bytes do not fit the entry's 16-bit size field or the configured cap.
    #[error("preload of {size} bytes exceeds the limit of {limit} bytes")]
    PreloadTooLarge { size: usize, limit: usize },

    /// Chunk file index would exceed the supported number of chunk files.
    #[error("too many chunk files: chunk {0} exceeds the limit")]
    TooManyChunkFiles(usize),

    /// Store configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signing key material rejected.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Wildcard pattern could not be compiled.
    #[error("invalid wildcard pattern: {0}")]
    InvalidPattern(#[from] glob::PatternError),
}

/// Result type for packed store operations.
pub type Result<T> = std::result::Result<T, Error>;
