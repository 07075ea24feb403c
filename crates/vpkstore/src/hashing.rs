//! Two-level hash tree over chunk contents and the directory.
//!
//! Level one is one MD5 per 1 MiB fraction of every chunk. Level two hashes
//! the serialized fraction table and the directory tree, so a corrupted chunk
//! byte only invalidates its own fraction plus the aggregate.

use std::io;

use vpkstore_common::{BinaryReader, BinaryWriter, Md5Context, Md5Digest};

use crate::format::{ChunkHashRecord, SelfHashes, FRACTION_SIZE};
use crate::io::{read_full, ChunkFile};
use crate::{Error, Result};

/// MD5 of one fraction of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHashFraction {
    /// Chunk file index
    pub chunk: u16,
    /// Fraction index, `offset / FRACTION_SIZE`
    pub fraction: u32,
    /// Bytes hashed; equals `FRACTION_SIZE` except for a chunk's last fraction
    pub length: u32,
    /// Digest
    pub md5: Md5Digest,
}

impl ChunkHashFraction {
    #[inline]
    fn key(&self) -> (u16, u32) {
        (self.chunk, self.fraction)
    }
}

/// Fraction hashes sorted by `(chunk, fraction)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FractionTable {
    fractions: Vec<ChunkHashFraction>,
}

impl FractionTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fractions.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[ChunkHashFraction] {
        &self.fractions
    }

    pub fn lookup(&self, chunk: u16, fraction: u32) -> Option<&ChunkHashFraction> {
        self.fractions
            .binary_search_by(|f| f.key().cmp(&(chunk, fraction)))
            .ok()
            .map(|i| &self.fractions[i])
    }

    /// Fractions of one chunk, in order.
    pub fn chunk(&self, chunk: u16) -> &[ChunkHashFraction] {
        let start = self.fractions.partition_point(|f| f.chunk < chunk);
        let end = self.fractions.partition_point(|f| f.chunk <= chunk);
        &self.fractions[start..end]
    }

    pub fn remove_chunk(&mut self, chunk: u16) {
        self.fractions.retain(|f| f.chunk != chunk);
    }

    /// Forget the fractions of `chunk` that a write at `offset` can change.
    ///
    /// Full fractions that end at or before `offset` keep their digests.
    pub fn invalidate_from(&mut self, chunk: u16, offset: u64) {
        self.fractions.retain(|f| {
            f.chunk != chunk
                || (f.length as u64 == FRACTION_SIZE
                    && f.fraction as u64 * FRACTION_SIZE + FRACTION_SIZE <= offset)
        });
    }

    /// Replace one chunk's fractions.
    pub fn replace_chunk(&mut self, chunk: u16, fractions: Vec<ChunkHashFraction>) {
        self.remove_chunk(chunk);
        let at = self.fractions.partition_point(|f| f.chunk < chunk);
        self.fractions.splice(at..at, fractions);
    }

    /// Whether a chunk's fractions are contiguous and cover `chunk_len` bytes.
    pub fn is_complete(&self, chunk: u16, chunk_len: u64) -> bool {
        let fractions = self.chunk(chunk);
        let mut covered = 0u64;
        for (i, f) in fractions.iter().enumerate() {
            if f.fraction as usize != i || covered != f.fraction as u64 * FRACTION_SIZE {
                return false;
            }
            covered += f.length as u64;
        }
        covered == chunk_len
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new(Vec::with_capacity(self.len() * ChunkHashRecord::SIZE));
        for f in &self.fractions {
            writer.write_struct(&ChunkHashRecord {
                chunk: f.chunk as u32,
                fraction: f.fraction,
                length: f.length,
                md5: f.md5.0,
            })?;
        }
        Ok(writer.into_inner())
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() % ChunkHashRecord::SIZE != 0 {
            return Err(Error::MalformedDirectory(format!(
                "chunk hash table size {} is not a multiple of {}",
                data.len(),
                ChunkHashRecord::SIZE
            )));
        }

        let mut reader = BinaryReader::new(data);
        let mut fractions = Vec::with_capacity(data.len() / ChunkHashRecord::SIZE);
        while !reader.is_empty() {
            let record: ChunkHashRecord = reader.read_struct()?;
            let chunk = u16::try_from(record.chunk).map_err(|_| {
                Error::MalformedDirectory(format!("chunk index {} out of range", { record.chunk }))
            })?;
            fractions.push(ChunkHashFraction {
                chunk,
                fraction: record.fraction,
                length: record.length,
                md5: Md5Digest(record.md5),
            });
        }

        fractions.sort_by_key(ChunkHashFraction::key);
        Ok(Self { fractions })
    }
}

/// Hash a chunk file fraction by fraction.
pub(crate) fn hash_chunk(chunk: u16, file: &mut dyn ChunkFile) -> io::Result<Vec<ChunkHashFraction>> {
    file.seek_to(0)?;
    let mut buf = vec![0u8; FRACTION_SIZE as usize];
    let mut fractions = Vec::new();

    loop {
        let n = read_full(file, &mut buf)?;
        if n == 0 {
            break;
        }
        fractions.push(ChunkHashFraction {
            chunk,
            fraction: fractions.len() as u32,
            length: n as u32,
            md5: Md5Digest::compute(&buf[..n]),
        });
        if n < buf.len() {
            break;
        }
    }

    Ok(fractions)
}

/// Hash an in-memory chunk.
pub(crate) fn hash_buffer(chunk: u16, data: &[u8]) -> Vec<ChunkHashFraction> {
    data.chunks(FRACTION_SIZE as usize)
        .enumerate()
        .map(|(i, block)| ChunkHashFraction {
            chunk,
            fraction: i as u32,
            length: block.len() as u32,
            md5: Md5Digest::compute(block),
        })
        .collect()
}

/// Directory-level digests persisted in the directory file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryHashes {
    /// MD5 of the serialized tree.
    pub directory: Md5Digest,
    /// MD5 of the serialized fraction table.
    pub chunk_hashes: Md5Digest,
    /// MD5 of `directory || chunk_hashes`.
    pub total: Md5Digest,
}

impl DirectoryHashes {
    pub(crate) fn compute(tree: &[u8], table: &[u8]) -> Self {
        let directory = Md5Digest::compute(tree);
        let chunk_hashes = Md5Digest::compute(table);
        Self {
            directory,
            chunk_hashes,
            total: Self::combine(&directory, &chunk_hashes),
        }
    }

    pub(crate) fn combine(directory: &Md5Digest, chunk_hashes: &Md5Digest) -> Md5Digest {
        let mut ctx = Md5Context::new();
        ctx.update(directory.as_bytes());
        ctx.update(chunk_hashes.as_bytes());
        ctx.finish()
    }

    /// Whether the total agrees with the two component digests.
    pub fn is_consistent(&self) -> bool {
        Self::combine(&self.directory, &self.chunk_hashes) == self.total
    }

    /// Whether nothing has been hashed yet.
    pub fn is_empty(&self) -> bool {
        self.directory.is_zero() && self.chunk_hashes.is_zero() && self.total.is_zero()
    }

    pub(crate) fn to_record(self) -> SelfHashes {
        SelfHashes {
            directory_md5: self.directory.0,
            chunk_hashes_md5: self.chunk_hashes.0,
            total_md5: self.total.0,
        }
    }

    pub(crate) fn from_record(record: &SelfHashes) -> Self {
        Self {
            directory: Md5Digest(record.directory_md5),
            chunk_hashes: Md5Digest(record.chunk_hashes_md5),
            total: Md5Digest(record.total_md5),
        }
    }
}
