//! The packed store: directory, chunk files and the read path.
//!
//! # Example
//!
//! ```no_run
//! use vpkstore::{PackedStore, StoreConfig};
//!
//! let mut store = PackedStore::create("content/pak01_dir.vpk", StoreConfig::default())?;
//! store.add_file("models/x.mdl", 0, b"model bytes", false, None)?;
//! store.write()?;
//!
//! let store = PackedStore::open("content/pak01_dir.vpk", StoreConfig::default())?;
//! if let Some(mut handle) = store.open_file("Models\\X.mdl") {
//!     let mut buf = vec![0u8; handle.size() as usize];
//!     handle.read(&mut buf);
//! }
//! # Ok::<(), vpkstore::Error>(())
//! ```

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use vpkstore_common::crc::{self, ContentCrc};
use vpkstore_common::{BinaryReader, BinaryWriter, Md5Digest};

use crate::cache::{ChunkSource, ReadCache};
use crate::chunk_writer::ChunkWriter;
use crate::config::StoreConfig;
use crate::directory::{Directory, Upsert};
use crate::entry::{FileDescriptor, FilePart};
use crate::format::{
    DirectoryHeader, SelfHashes, StorePaths, EMBEDDED_CHUNK, FRACTION_SIZE,
    MAX_CHUNK_FILES,
};
use crate::handle::VpkHandle;
use crate::hasher::{HashDispatcher, ThreadPoolHasher};
use crate::hashing::{hash_buffer, hash_chunk, ChunkHashFraction, DirectoryHashes, FractionTable};
use crate::io::{read_full, write_atomic, FileProvider, FsFileProvider};
use crate::listing::{self, FileAndDirLists};
use crate::path::{normalize, SplitPath};
use crate::signing::{SignatureBlock, SignatureCheck, SigningKeys, SIGNATURE_SECTION_SIZE};
use crate::stats::CacheStats;
use crate::tracker::FileTracker;
use crate::{Error, Result};

/// Outcome of [`PackedStore::add_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddFileResult {
    /// The path was not in the directory.
    NewFile,
    /// Stored CRC and size already match; nothing was written.
    SameFileUnchanged,
    /// The path existed with different content and now points at new bytes.
    FileUpdated,
}

/// A directory file plus its chunk files.
///
/// Reads take `&self` and may run from any number of threads. Building
/// (`add_file*`, `remove_file_from_directory`, `write`) takes `&mut self`.
pub struct PackedStore {
    paths: StorePaths,
    config: StoreConfig,
    provider: Arc<dyn FileProvider>,
    directory: Directory,
    embedded: Vec<u8>,
    trackers: Vec<FileTracker>,
    cache: ReadCache,
    fractions: FractionTable,
    hashes: DirectoryHashes,
    signature: Option<SignatureBlock>,
    signed_size: u64,
    signing_keys: Option<SigningKeys>,
    writer: ChunkWriter,
    tree_bytes: Option<Vec<u8>>,
    stale: BTreeSet<u16>,
}

impl PackedStore {
    /// Start an empty store. Nothing touches disk until the first add.
    pub fn create<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        Self::create_with(
            path,
            config,
            Arc::new(FsFileProvider::new()),
            Arc::new(ThreadPoolHasher::new()),
        )
    }

    /// Start an empty store with explicit collaborators.
    pub fn create_with<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        provider: Arc<dyn FileProvider>,
        hasher: Arc<dyn HashDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let paths = StorePaths::from_dir_path(path);
        debug!(path = %paths.dir_path().display(), "creating packed store");

        Ok(Self {
            writer: ChunkWriter::new(paths.clone(), config.write_chunk_size, 0),
            cache: ReadCache::new(config.cache_lines, hasher),
            paths,
            config,
            provider,
            directory: Directory::new(),
            embedded: Vec::new(),
            trackers: Vec::new(),
            fractions: FractionTable::new(),
            hashes: DirectoryHashes::default(),
            signature: None,
            signed_size: 0,
            signing_keys: None,
            tree_bytes: None,
            stale: BTreeSet::new(),
        })
    }

    /// Open an existing store from its directory file.
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        Self::open_with(
            path,
            config,
            Arc::new(FsFileProvider::new()),
            Arc::new(ThreadPoolHasher::new()),
        )
    }

    /// Open an existing store with explicit collaborators.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        provider: Arc<dyn FileProvider>,
        hasher: Arc<dyn HashDispatcher>,
    ) -> Result<Self> {
        let mut store = Self::create_with(path, config, provider, hasher)?;
        let dir_path = store.paths.dir_path();
        let bytes = store.provider.read_all(&dir_path)?;
        store.load(&bytes)?;

        info!(
            path = %dir_path.display(),
            entries = store.entry_count(),
            chunks = store.chunk_count(),
            signed = store.is_signed(),
            "opened packed store"
        );
        Ok(store)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let mut reader = BinaryReader::new(bytes);
        let header: DirectoryHeader = reader.read_struct()?;

        if header.signature != DirectoryHeader::SIGNATURE {
            return Err(Error::InvalidMagic {
                expected: DirectoryHeader::SIGNATURE,
                actual: header.signature,
            });
        }
        if header.version != DirectoryHeader::VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }

        let described = header.signed_size() + header.signature_size as u64;
        if (bytes.len() as u64) < described {
            return Err(Error::MalformedDirectory(format!(
                "directory file is {} bytes, header describes {described}",
                bytes.len()
            )));
        }

        let tree = reader.read_bytes(header.tree_size as usize)?;
        let embedded = reader.read_bytes(header.embedded_size as usize)?;
        let table = reader.read_bytes(header.chunk_hashes_size as usize)?;
        let self_hashes = reader.read_bytes(header.self_hashes_size as usize)?;
        let signature = reader.read_bytes(header.signature_size as usize)?;

        let directory = Directory::parse_tree(tree)?;
        let fractions = FractionTable::parse(table)?;
        let hashes = match self_hashes.len() {
            0 => DirectoryHashes::default(),
            SelfHashes::SIZE => {
                DirectoryHashes::from_record(&BinaryReader::new(self_hashes).read_struct()?)
            }
            n => {
                return Err(Error::MalformedDirectory(format!(
                    "self hash section is {n} bytes, expected {}",
                    SelfHashes::SIZE
                )))
            }
        };
        let signature = if signature.is_empty() {
            None
        } else {
            Some(SignatureBlock::parse(signature)?)
        };

        let mut chunk_count = 0usize;
        for part in directory.parts() {
            if part.is_embedded() {
                if part.end() > embedded.len() as u64 {
                    return Err(Error::MalformedDirectory(format!(
                        "entry ends at {} past embedded chunk of {} bytes",
                        part.end(),
                        embedded.len()
                    )));
                }
            } else {
                chunk_count = chunk_count.max(part.chunk as usize + 1);
            }
        }
        for fraction in fractions.as_slice() {
            if fraction.chunk != EMBEDDED_CHUNK {
                chunk_count = chunk_count.max(fraction.chunk as usize + 1);
            }
        }
        if chunk_count > MAX_CHUNK_FILES {
            return Err(Error::TooManyChunkFiles(chunk_count - 1));
        }

        self.directory = directory;
        self.embedded = embedded.to_vec();
        self.fractions = fractions;
        self.hashes = hashes;
        self.signature = signature;
        self.signed_size = header.signed_size();
        self.tree_bytes = Some(tree.to_vec());
        self.trackers.clear();
        self.ensure_trackers(chunk_count);
        self.writer = ChunkWriter::new(
            self.paths.clone(),
            self.config.write_chunk_size,
            chunk_count as u16,
        );
        Ok(())
    }

    fn ensure_trackers(&mut self, count: usize) {
        while self.trackers.len() < count {
            let chunk = self.trackers.len() as u16;
            self.trackers
                .push(FileTracker::new(chunk, self.paths.chunk_path(chunk)));
        }
    }

    fn source(&self) -> ChunkSource<'_> {
        ChunkSource {
            trackers: &self.trackers,
            provider: self.provider.as_ref(),
            hashes: &self.fractions,
        }
    }

    // ---- reading ----

    /// Look up a logical path. A miss is `None`.
    pub fn open_file(&self, name: &str) -> Option<VpkHandle<'_>> {
        let normalized = normalize(name);
        self.directory
            .get(&normalized)
            .map(|entry| VpkHandle::new(self, entry))
    }

    /// Whether a logical path is present.
    pub fn contains(&self, name: &str) -> bool {
        self.directory.get(&normalize(name)).is_some()
    }

    /// Read content bytes of `entry` starting at `position`.
    ///
    /// Preload bytes come first, then the chunk parts. Returns fewer bytes
    /// than requested only at end of file or after a recorded load failure.
    pub(crate) fn read_at(&self, entry: &FileDescriptor, position: u64, buf: &mut [u8]) -> usize {
        let size = entry.size();
        if position >= size || buf.is_empty() {
            return 0;
        }
        let want = (size - position).min(buf.len() as u64) as usize;
        let buf = &mut buf[..want];

        let preload = entry.preload();
        let mut done = 0usize;
        let mut pos = position;

        if pos < preload.len() as u64 {
            let start = pos as usize;
            let n = (preload.len() - start).min(want);
            buf[..n].copy_from_slice(&preload[start..start + n]);
            done += n;
            pos += n as u64;
        }

        while done < want {
            let Some((part, inner)) = entry.locate(pos - preload.len() as u64) else {
                break;
            };
            let n = (part.length as u64 - inner).min((want - done) as u64) as usize;
            let got = self.read_part(part, part.offset as u64 + inner, &mut buf[done..done + n]);
            done += got;
            pos += got as u64;
            if got < n {
                break;
            }
        }

        done
    }

    fn read_part(&self, part: &FilePart, offset: u64, buf: &mut [u8]) -> usize {
        if !part.is_embedded() {
            return self.cache.read(&self.source(), part.chunk, offset, buf);
        }

        let start = offset as usize;
        let end = start.saturating_add(buf.len()).min(self.embedded.len());
        if start >= end {
            return 0;
        }
        buf[..end - start].copy_from_slice(&self.embedded[start..end]);
        end - start
    }

    /// Read a whole file into memory.
    ///
    /// A vector shorter than the stored size means a chunk read failed; see
    /// [`PackedStore::pack_file_load_error_summary`].
    pub fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        let handle = self.open_file(name)?;
        let mut data = vec![0u8; handle.size() as usize];
        let n = self.read_at(handle.descriptor(), 0, &mut data);
        data.truncate(n);
        Some(data)
    }

    /// Stream a file and compare it against its stored content CRC.
    pub fn verify_file_crc(&self, name: &str) -> Option<bool> {
        let mut handle = self.open_file(name)?;
        let mut crc = ContentCrc::new();
        let mut buf = vec![0u8; (FRACTION_SIZE as usize).min(handle.size() as usize).max(1)];
        while !handle.is_eof() {
            let n = handle.read(&mut buf);
            if n == 0 {
                return Some(false);
            }
            crc.update(&buf[..n]);
        }
        Some(crc.finish() == handle.crc())
    }

    // ---- building ----

    /// Add or replace a file.
    ///
    /// The first `metadata_size` bytes (capped by the preload limit) are kept
    /// inline in the directory. The remainder goes to the open chunk file; if
    /// it does not fit, `allow_multichunk` splits it across chunk files,
    /// otherwise it starts a new chunk file. A payload larger than a whole
    /// chunk file without splitting is [`Error::PayloadTooLarge`].
    ///
    /// `crc` is the content CRC32C when the caller already has it.
    pub fn add_file(
        &mut self,
        name: &str,
        metadata_size: usize,
        data: &[u8],
        allow_multichunk: bool,
        crc: Option<u32>,
    ) -> Result<AddFileResult> {
        let normalized = normalize(name);
        if SplitPath::new(&normalized).is_none() {
            return Err(Error::InvalidPath(name.to_string()));
        }

        let crc = crc.unwrap_or_else(|| crc::content_crc(data));
        if let Some(existing) = self.directory.get_checked(&normalized)? {
            if existing.crc() == crc && existing.size() == data.len() as u64 {
                debug!(path = %normalized, "file unchanged");
                return Ok(AddFileResult::SameFileUnchanged);
            }
        }

        let preload_len = metadata_size
            .min(self.config.max_preload_size)
            .min(data.len());
        let (preload, payload) = data.split_at(preload_len);

        let parts = if payload.is_empty() {
            vec![FilePart {
                chunk: EMBEDDED_CHUNK,
                offset: 0,
                length: 0,
            }]
        } else if self.config.embed_chunk {
            vec![self.append_embedded(payload)?]
        } else {
            self.append_chunks(payload, allow_multichunk)?
        };

        let descriptor = FileDescriptor::new(crc, preload.to_vec(), parts);
        let outcome = self.directory.upsert(&normalized, descriptor)?;
        self.tree_bytes = None;

        debug!(path = %normalized, size = data.len(), ?outcome, "added file");
        Ok(match outcome {
            Upsert::Inserted => AddFileResult::NewFile,
            Upsert::Replaced => AddFileResult::FileUpdated,
        })
    }

    fn append_embedded(&mut self, payload: &[u8]) -> Result<FilePart> {
        let offset = self.embedded.len();
        let end = offset as u64 + payload.len() as u64;
        if end > u32::MAX as u64 {
            return Err(Error::PayloadTooLarge {
                size: payload.len() as u64,
                limit: u32::MAX as u64 - offset as u64,
            });
        }
        self.embedded.extend_from_slice(payload);
        self.stale.insert(EMBEDDED_CHUNK);
        Ok(FilePart {
            chunk: EMBEDDED_CHUNK,
            offset: offset as u32,
            length: payload.len() as u32,
        })
    }

    fn append_chunks(&mut self, payload: &[u8], allow_multichunk: bool) -> Result<Vec<FilePart>> {
        let limit = self.config.write_chunk_size;
        let size = payload.len() as u64;

        if !allow_multichunk && size > self.writer.remaining()? {
            if size > limit {
                return Err(Error::PayloadTooLarge { size, limit });
            }
            self.writer.rotate()?;
        }

        let mut parts = Vec::with_capacity(1);
        let mut rest = payload;
        while !rest.is_empty() {
            let room = self.writer.remaining()?;
            if room == 0 {
                self.writer.rotate()?;
                continue;
            }
            let take = room.min(rest.len() as u64) as usize;
            let part = self.writer.append(&rest[..take])?;
            self.note_chunk_write(&part);
            parts.push(part);
            rest = &rest[take..];
        }
        Ok(parts)
    }

    fn note_chunk_write(&mut self, part: &FilePart) {
        let chunk = part.chunk;
        self.ensure_trackers(chunk as usize + 1);
        self.stale.insert(chunk);
        // Fractions reaching past `offset` no longer describe the file.
        self.fractions.invalidate_from(chunk, part.offset as u64);
        self.cache.invalidate_chunk(chunk);
    }

    /// Insert a descriptor whose payload is already in place.
    pub fn add_file_to_directory(
        &mut self,
        name: &str,
        descriptor: FileDescriptor,
    ) -> Result<AddFileResult> {
        let normalized = normalize(name);
        if SplitPath::new(&normalized).is_none() {
            return Err(Error::InvalidPath(name.to_string()));
        }
        if descriptor.preload().len() > self.config.max_preload_size {
            return Err(Error::PreloadTooLarge {
                size: descriptor.preload().len(),
                limit: self.config.max_preload_size,
            });
        }

        for part in descriptor.parts() {
            if part.is_embedded() {
                if part.end() > self.embedded.len() as u64 {
                    return Err(Error::MalformedDirectory(format!(
                        "part ends at {} past embedded chunk of {} bytes",
                        part.end(),
                        self.embedded.len()
                    )));
                }
            } else if part.chunk as usize >= MAX_CHUNK_FILES {
                return Err(Error::TooManyChunkFiles(part.chunk as usize));
            }
        }

        if let Some(existing) = self.directory.get_checked(&normalized)? {
            if *existing == descriptor {
                return Ok(AddFileResult::SameFileUnchanged);
            }
        }

        for part in descriptor.parts().iter().filter(|p| !p.is_embedded()) {
            self.ensure_trackers(part.chunk as usize + 1);
            if self.fractions.chunk(part.chunk).is_empty() {
                self.stale.insert(part.chunk);
            }
        }

        let outcome = self.directory.upsert(&normalized, descriptor)?;
        self.tree_bytes = None;
        Ok(match outcome {
            Upsert::Inserted => AddFileResult::NewFile,
            Upsert::Replaced => AddFileResult::FileUpdated,
        })
    }

    /// Drop a path from the directory. Chunk bytes are left in place.
    pub fn remove_file_from_directory(&mut self, name: &str) -> bool {
        let normalized = normalize(name);
        let removed = self.directory.remove(&normalized);
        if removed {
            debug!(path = %normalized, "removed file");
            self.tree_bytes = None;
        }
        removed
    }

    /// Write the directory file.
    ///
    /// Chunks written since the last write are rehashed first; the directory
    /// is signed when keys are set.
    pub fn write(&mut self) -> Result<()> {
        self.writer.sync()?;

        // A chunk whose fraction set does not cover it has not been hashed yet.
        for chunk in 0..self.chunk_count() {
            if self.stale.contains(&chunk) {
                continue;
            }
            let len = self.provider.size(&self.paths.chunk_path(chunk))?;
            if !self.fractions.is_complete(chunk, len) {
                self.stale.insert(chunk);
            }
        }

        let stale: Vec<u16> = self.stale.iter().copied().collect();
        for (chunk, fractions) in self.hash_chunks(&stale)? {
            self.replace_fractions(chunk, fractions);
        }

        let tree = self.directory.serialize_tree()?;
        let table = self.fractions.serialize()?;
        let hashes = DirectoryHashes::compute(&tree, &table);
        let signature_size = if self.signing_keys.is_some() {
            SIGNATURE_SECTION_SIZE
        } else {
            0
        };

        let header = DirectoryHeader {
            signature: DirectoryHeader::SIGNATURE,
            version: DirectoryHeader::VERSION,
            tree_size: section_size(&tree)?,
            embedded_size: section_size(&self.embedded)?,
            chunk_hashes_size: section_size(&table)?,
            self_hashes_size: SelfHashes::SIZE as u32,
            signature_size: signature_size as u32,
        };

        let mut writer = BinaryWriter::new(Vec::with_capacity(
            header.signed_size() as usize + signature_size,
        ));
        writer.write_struct(&header)?;
        writer.write_bytes(&tree)?;
        writer.write_bytes(&self.embedded)?;
        writer.write_bytes(&table)?;
        writer.write_struct(&hashes.to_record())?;
        let mut bytes = writer.into_inner();

        let signed_size = bytes.len() as u64;
        let signature = match &self.signing_keys {
            Some(keys) => {
                let block = keys.sign(&bytes);
                bytes.extend_from_slice(&block.serialize()?);
                Some(block)
            }
            None => None,
        };

        let dir_path = self.paths.dir_path();
        write_atomic(&dir_path, &bytes)?;
        info!(
            path = %dir_path.display(),
            entries = self.entry_count(),
            chunks = self.chunk_count(),
            bytes = bytes.len(),
            signed = signature.is_some(),
            "wrote directory"
        );

        self.hashes = hashes;
        self.signature = signature;
        self.signed_size = signed_size;
        self.tree_bytes = Some(tree);
        self.stale.clear();
        Ok(())
    }

    // ---- hashing ----

    fn hash_chunks(&self, chunks: &[u16]) -> Result<Vec<(u16, Vec<ChunkHashFraction>)>> {
        chunks
            .par_iter()
            .map(|&chunk| -> Result<(u16, Vec<ChunkHashFraction>)> {
                if chunk == EMBEDDED_CHUNK {
                    return Ok((chunk, hash_buffer(chunk, &self.embedded)));
                }
                let mut file = self.provider.open(&self.paths.chunk_path(chunk))?;
                let fractions = hash_chunk(chunk, file.as_mut())?;
                debug!(chunk, fractions = fractions.len(), "hashed chunk file");
                Ok((chunk, fractions))
            })
            .collect()
    }

    fn all_chunks(&self) -> Vec<u16> {
        let mut chunks: Vec<u16> = (0..self.chunk_count()).collect();
        if !self.embedded.is_empty() {
            chunks.push(EMBEDDED_CHUNK);
        }
        chunks
    }

    fn replace_fractions(&mut self, chunk: u16, fractions: Vec<ChunkHashFraction>) {
        if fractions.is_empty() {
            self.fractions.remove_chunk(chunk);
        } else {
            self.fractions.replace_chunk(chunk, fractions);
        }
        self.stale.remove(&chunk);
        if chunk != EMBEDDED_CHUNK {
            self.cache.invalidate_chunk(chunk);
        }
    }

    /// Recompute the fraction hashes of every chunk from disk.
    pub fn hash_all_chunk_files(&mut self) -> Result<()> {
        let chunks = self.all_chunks();
        let computed = self.hash_chunks(&chunks)?;

        self.fractions = FractionTable::new();
        for (chunk, fractions) in computed {
            self.replace_fractions(chunk, fractions);
        }
        info!(chunks = chunks.len(), fractions = self.fractions.len(), "hashed chunk files");
        Ok(())
    }

    /// Recompute one chunk's fraction hashes. Run [`PackedStore::hash_metadata`] after.
    pub fn hash_chunk_file(&mut self, chunk: u16) -> Result<()> {
        if chunk != EMBEDDED_CHUNK && chunk as usize >= self.trackers.len() {
            return Err(Error::TooManyChunkFiles(chunk as usize));
        }
        for (chunk, fractions) in self.hash_chunks(&[chunk])? {
            self.replace_fractions(chunk, fractions);
        }
        Ok(())
    }

    /// Recompute the directory, chunk-hashes and total digests.
    pub fn hash_metadata(&mut self) -> Result<DirectoryHashes> {
        let tree = self.current_tree()?;
        let table = self.fractions.serialize()?;
        let hashes = DirectoryHashes::compute(&tree, &table);
        self.hashes = hashes;
        Ok(hashes)
    }

    /// Rehash every chunk, then the metadata.
    pub fn hash_everything(&mut self) -> Result<DirectoryHashes> {
        self.hash_all_chunk_files()?;
        self.hash_metadata()
    }

    fn current_tree(&self) -> Result<Cow<'_, [u8]>> {
        match &self.tree_bytes {
            Some(tree) => Ok(Cow::Borrowed(tree.as_slice())),
            None => Ok(Cow::Owned(self.directory.serialize_tree()?)),
        }
    }

    /// Whether the tree still hashes to the stored directory MD5.
    pub fn test_directory_hash(&self) -> bool {
        match self.current_tree() {
            Ok(tree) => Md5Digest::compute(&tree) == self.hashes.directory,
            Err(e) => {
                warn!(error = %e, "could not serialize directory tree");
                false
            }
        }
    }

    /// Rehash every chunk from disk and compare against the stored digests.
    pub fn test_master_chunk_hash(&self) -> bool {
        let computed = match self.hash_chunks(&self.all_chunks()) {
            Ok(computed) => computed,
            Err(e) => {
                warn!(error = %e, "could not rehash chunk files");
                return false;
            }
        };

        let mut table = FractionTable::new();
        for (chunk, fractions) in computed.into_iter().filter(|(_, f)| !f.is_empty()) {
            table.replace_chunk(chunk, fractions);
        }
        let Ok(serialized) = table.serialize() else {
            return false;
        };

        let chunk_hashes = Md5Digest::compute(&serialized);
        chunk_hashes == self.hashes.chunk_hashes
            && DirectoryHashes::combine(&self.hashes.directory, &chunk_hashes) == self.hashes.total
    }

    // ---- signing ----

    /// Sign the directory on every following [`PackedStore::write`].
    pub fn set_keys_for_signing(&mut self, private_key: &[u8], public_key: &[u8]) -> Result<()> {
        self.signing_keys = Some(SigningKeys::from_bytes(private_key, public_key)?);
        Ok(())
    }

    pub fn set_signing_keys(&mut self, keys: SigningKeys) {
        self.signing_keys = Some(keys);
    }

    /// Verify the signature against the directory bytes as they are on disk now.
    pub fn check_signature(&self, expected_public_key: Option<&[u8]>) -> SignatureCheck {
        let Some(block) = &self.signature else {
            return SignatureCheck::NotSigned;
        };
        // Skip the re-read when the key already rules the block out.
        if !block.accepts_key(expected_public_key) {
            return SignatureCheck::WrongKey;
        }

        match self.read_signed_bytes() {
            Ok(signed) => block.verify(&signed, expected_public_key),
            Err(e) => {
                warn!(error = %e, "could not re-read signed directory bytes");
                SignatureCheck::Failed
            }
        }
    }

    fn read_signed_bytes(&self) -> Result<Vec<u8>> {
        let mut file = self.provider.open(&self.paths.dir_path())?;
        let mut signed = vec![0u8; self.signed_size as usize];
        let n = read_full(file.as_mut(), &mut signed)?;
        if n < signed.len() {
            return Err(Error::MalformedDirectory(format!(
                "directory file shrank to {n} bytes, {} are signed",
                signed.len()
            )));
        }
        Ok(signed)
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Public key stored with the signature.
    pub fn signature_public_key(&self) -> Option<&[u8]> {
        self.signature.as_ref().map(|s| s.public_key.as_slice())
    }

    /// Number of directory bytes covered by the signature.
    pub fn signed_size(&self) -> u64 {
        self.signed_size
    }

    // ---- maintenance ----

    /// Poll finished cache hashes. Returns the number of newly failed lines.
    pub fn check_md5_results(&self) -> usize {
        self.cache.check_md5_results()
    }

    pub fn retry_bad_cache_line(&self, slot: usize) -> bool {
        self.cache.retry_bad_cache_line(&self.source(), slot)
    }

    pub fn retry_all_bad_cache_lines(&self) -> usize {
        self.cache.retry_all_bad_cache_lines(&self.source())
    }

    /// Maintenance tick: reconcile hashes, then re-read failed lines.
    ///
    /// Returns the number of lines that failed verification in this tick.
    pub fn service(&self) -> usize {
        let failed = self.check_md5_results();
        let retried = self.retry_all_bad_cache_lines();
        if failed > 0 || retried > 0 {
            debug!(failed, retried, "cache service tick");
        }
        failed
    }

    /// Every load failure since the store opened.
    pub fn pack_file_load_error_summary(&self) -> String {
        self.cache.summary()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ---- listing & accessors ----

    /// Normalized names, optionally filtered by a glob wildcard.
    pub fn get_file_list(&self, wildcard: Option<&str>) -> Result<Vec<String>> {
        listing::file_list(&self.directory, wildcard)
    }

    pub fn get_file_and_dir_lists(
        &self,
        wildcard: Option<&str>,
        sorted: bool,
    ) -> Result<FileAndDirLists> {
        listing::file_and_dir_lists(&self.directory, wildcard, sorted)
    }

    /// Entries in directory order.
    pub fn entries(&self) -> impl Iterator<Item = (String, &FileDescriptor)> + '_ {
        self.directory.iter()
    }

    pub fn entry_count(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Number of numbered chunk files.
    pub fn chunk_count(&self) -> u16 {
        self.trackers.len() as u16
    }

    /// Bytes of payload embedded in the directory file.
    pub fn embedded_size(&self) -> usize {
        self.embedded.len()
    }

    pub fn hashes(&self) -> DirectoryHashes {
        self.hashes
    }

    pub fn fraction_hashes(&self) -> &[ChunkHashFraction] {
        self.fractions.as_slice()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }
}

fn section_size(section: &[u8]) -> Result<u32> {
    u32::try_from(section.len()).map_err(|_| {
        Error::MalformedDirectory(format!("section of {} bytes exceeds 4 GiB", section.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::ImmediateHasher;
    use crate::testing::pattern;

    fn config() -> StoreConfig {
        StoreConfig::default().with_write_chunk_size(64 * 1024)
    }

    fn create(dir: &Path, config: StoreConfig) -> PackedStore {
        PackedStore::create_with(
            dir.join("pak_dir.vpk"),
            config,
            Arc::new(FsFileProvider::new()),
            Arc::new(ImmediateHasher::new()),
        )
        .unwrap()
    }

    fn reopen(dir: &Path, config: StoreConfig) -> PackedStore {
        PackedStore::open_with(
            dir.join("pak_dir.vpk"),
            config,
            Arc::new(FsFileProvider::new()),
            Arc::new(ImmediateHasher::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_preload_and_chunk_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        let data = pattern(1000, 4);
        store.add_file("a/b.bin", 100, &data, false, None).unwrap();

        let handle = store.open_file("A\\B.BIN").unwrap();
        assert_eq!(handle.preload(), &data[..100]);
        assert_eq!(handle.range(), Some(0..900));
        assert_eq!(store.read_file("a/b.bin").unwrap(), data);

        let mut handle = store.open_file("a/b.bin").unwrap();
        handle.seek_to(95);
        let mut buf = [0u8; 10];
        assert_eq!(handle.read(&mut buf), 10);
        assert_eq!(&buf, &data[95..105]);
        assert_eq!(handle.tell(), 105);
    }

    #[test]
    fn test_preload_is_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config().with_max_preload_size(8));
        store.add_file("x.txt", 1000, b"0123456789abc", false, None).unwrap();
        let handle = store.open_file("x.txt").unwrap();
        assert_eq!(handle.preload(), b"01234567");
        assert_eq!(handle.size(), 13);
    }

    #[test]
    fn test_update_and_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        assert_eq!(
            store.add_file("f.txt", 0, b"one", false, None).unwrap(),
            AddFileResult::NewFile
        );
        assert_eq!(
            store.add_file("F.TXT", 0, b"one", false, None).unwrap(),
            AddFileResult::SameFileUnchanged
        );
        assert_eq!(
            store.add_file("f.txt", 0, b"two!", false, None).unwrap(),
            AddFileResult::FileUpdated
        );
        assert_eq!(store.read_file("f.txt").unwrap(), b"two!");
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_oversized_payload_without_split() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        let data = vec![0u8; 64 * 1024 + 1];
        assert!(matches!(
            store.add_file("big.bin", 0, &data, false, None),
            Err(Error::PayloadTooLarge { .. })
        ));
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_no_split_starts_new_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        store.add_file("a.bin", 0, &vec![1u8; 40 * 1024], false, None).unwrap();
        store.add_file("b.bin", 0, &vec![2u8; 40 * 1024], false, None).unwrap();

        let b = store.open_file("b.bin").unwrap();
        assert_eq!(b.chunk(), Some(1));
        assert_eq!(b.range(), Some(0..40 * 1024));
        assert_eq!(store.chunk_count(), 2);
    }

    #[test]
    fn test_multichunk_split() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        store.add_file("a.bin", 0, &vec![1u8; 40 * 1024], false, None).unwrap();
        let data = pattern(100 * 1024, 5);
        store.add_file("big.bin", 0, &data, true, None).unwrap();

        let handle = store.open_file("big.bin").unwrap();
        let parts = handle.descriptor().parts();
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].chunk, parts[0].offset, parts[0].length), (0, 40 * 1024, 24 * 1024));
        assert_eq!((parts[1].chunk, parts[1].length), (1, 64 * 1024));
        assert_eq!((parts[2].chunk, parts[2].length), (2, 12 * 1024));
        assert_eq!(store.read_file("big.bin").unwrap(), data);
        assert_eq!(store.verify_file_crc("big.bin"), Some(true));
    }

    #[test]
    fn test_empty_and_preload_only_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        store.add_file("empty.txt", 0, b"", false, None).unwrap();
        store.add_file("small.txt", 16, b"tiny", false, None).unwrap();
        store.write().unwrap();

        let store = reopen(tmp.path(), config());
        assert_eq!(store.read_file("empty.txt").unwrap(), b"");
        assert_eq!(store.read_file("small.txt").unwrap(), b"tiny");
        assert_eq!(store.chunk_count(), 0);
        assert!(store.test_master_chunk_hash());
    }

    #[test]
    fn test_remove_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        store.add_file("gone.txt", 0, b"bye", false, None).unwrap();
        assert!(store.remove_file_from_directory("GONE.txt"));
        assert!(!store.remove_file_from_directory("gone.txt"));
        assert!(store.open_file("gone.txt").is_none());
        assert!(store.read_file("gone.txt").is_none());
    }

    #[test]
    fn test_invalid_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        assert!(matches!(
            store.add_file("", 0, b"x", false, None),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            store.add_file("dir/", 0, b"x", false, None),
            Err(Error::InvalidPath(_))
        ));
        for name in ["../../escape.txt", "a/../b.txt", "dir/file. "] {
            assert!(
                matches!(store.add_file(name, 0, b"x", false, None), Err(Error::InvalidPath(_))),
                "{name}"
            );
        }
        let descriptor = FileDescriptor::new(
            0,
            b"x".to_vec(),
            vec![FilePart { chunk: EMBEDDED_CHUNK, offset: 0, length: 0 }],
        );
        assert!(matches!(
            store.add_file_to_directory("..\\escape.txt", descriptor),
            Err(Error::InvalidPath(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_names_with_spaces_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        for name in ["dir/file. x", "a/ /b.txt", "dir/ "] {
            store.add_file(name, 0, name.as_bytes(), false, None).unwrap();
        }
        store.write().unwrap();

        let store = reopen(tmp.path(), config());
        let mut names = store.get_file_list(None).unwrap();
        names.sort();
        assert_eq!(names, vec!["a/ /b.txt", "dir/ ", "dir/file. x"]);
        for name in &names {
            assert_eq!(store.read_file(name).unwrap(), name.as_bytes());
        }
    }

    #[test]
    fn test_embedded_store_is_single_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config().with_embedded_chunk(true);
        let mut store = create(tmp.path(), config.clone());
        let data = pattern(5000, 8);
        store.add_file("inside.bin", 10, &data, false, None).unwrap();
        store.write().unwrap();

        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["pak_dir.vpk"]);

        let store = reopen(tmp.path(), config);
        assert_eq!(store.embedded_size(), 4990);
        assert_eq!(store.read_file("inside.bin").unwrap(), data);
        assert!(store.test_directory_hash());
        assert!(store.test_master_chunk_hash());
    }

    #[test]
    fn test_add_file_to_directory_reuses_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        store.add_file("orig.bin", 0, b"shared payload", false, None).unwrap();
        let descriptor = store.open_file("orig.bin").unwrap().descriptor().clone();

        assert_eq!(
            store.add_file_to_directory("alias.bin", descriptor.clone()).unwrap(),
            AddFileResult::NewFile
        );
        assert_eq!(
            store.add_file_to_directory("alias.bin", descriptor).unwrap(),
            AddFileResult::SameFileUnchanged
        );
        assert_eq!(store.read_file("alias.bin").unwrap(), b"shared payload");

        let bad = FileDescriptor::new(0, Vec::new(), vec![FilePart { chunk: 600, offset: 0, length: 1 }]);
        assert!(matches!(
            store.add_file_to_directory("bad.bin", bad),
            Err(Error::TooManyChunkFiles(600))
        ));
    }

    #[test]
    fn test_oversized_preload_descriptor_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        let empty = vec![FilePart { chunk: EMBEDDED_CHUNK, offset: 0, length: 0 }];
        let big = FileDescriptor::new(0, vec![7; 70_000], empty.clone());

        assert!(matches!(
            store.add_file_to_directory("big.bin", big),
            Err(Error::PreloadTooLarge { size: 70_000, limit: 65_535 })
        ));
        assert!(store.is_empty());

        let fits = FileDescriptor::new(0, vec![7; 65_535], empty);
        store.add_file_to_directory("fits.bin", fits).unwrap();
        store.write().unwrap();
        let store = reopen(tmp.path(), config());
        assert_eq!(store.open_file("fits.bin").unwrap().preload().len(), 65_535);
    }

    #[test]
    fn test_append_to_reopened_store() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        store.add_file("first.bin", 0, &vec![1u8; 1000], false, None).unwrap();
        store.write().unwrap();

        let mut store = reopen(tmp.path(), config());
        store.add_file("second.bin", 0, &vec![2u8; 1000], false, None).unwrap();
        store.write().unwrap();

        let store = reopen(tmp.path(), config());
        assert_eq!(store.chunk_count(), 1);
        assert_eq!(store.open_file("second.bin").unwrap().range(), Some(1000..2000));
        assert_eq!(store.read_file("first.bin").unwrap(), vec![1u8; 1000]);
        assert!(store.test_master_chunk_hash());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pak_dir.vpk"), [0u8; 64]).unwrap();
        assert!(matches!(
            PackedStore::open(tmp.path().join("pak_dir.vpk"), config()),
            Err(Error::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_truncated_directory_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = create(tmp.path(), config());
        store.add_file("a.txt", 0, b"abc", false, None).unwrap();
        store.write().unwrap();

        let path = tmp.path().join("pak_dir.vpk");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(matches!(
            PackedStore::open(&path, config()),
            Err(Error::MalformedDirectory(_))
        ));
    }

    #[test]
    fn test_store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PackedStore>();
    }
}
