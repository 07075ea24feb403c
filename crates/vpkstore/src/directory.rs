//! In-memory directory: grouped name tree plus the sorted key index.
//!
//! Entries live in an arena addressed by `u32` ids. Each entry belongs to a
//! path group, each path group to an extension group; groups keep their
//! member ids in insertion order, which is also the serialized order, so a
//! loaded tree re-serializes to the same bytes.

use std::hash::BuildHasherDefault;

use hashbrown::HashMap as FastHashMap;
use rustc_hash::FxHasher;
use vpkstore_common::{BinaryReader, BinaryWriter};

use crate::entry::{FileDescriptor, FilePart};
use crate::format::{EMPTY_NAME, PART_TERMINATOR};
use crate::path::{path_hash, SplitPath};
use crate::{Error, Result};

type FxHashMap<K, V> = FastHashMap<K, V, BuildHasherDefault<FxHasher>>;

#[derive(Debug, Clone)]
struct DirEntry {
    base: String,
    path_group: u32,
    descriptor: FileDescriptor,
}

#[derive(Debug, Clone)]
struct ExtensionGroup {
    name: String,
    paths: Vec<u32>,
}

#[derive(Debug, Clone)]
struct PathGroup {
    extension: u32,
    name: String,
    files: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct IndexSlot {
    key: u32,
    entry: u32,
}

/// Outcome of [`Directory::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upsert {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Directory {
    entries: Vec<Option<DirEntry>>,
    free: Vec<u32>,
    extensions: Vec<ExtensionGroup>,
    paths: Vec<PathGroup>,
    extension_lookup: FxHashMap<String, u32>,
    path_lookup: FxHashMap<(u32, String), u32>,
    index: Vec<IndexSlot>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up by key only. Keys are unique, so no path comparison happens.
    pub fn get(&self, normalized: &str) -> Option<&FileDescriptor> {
        let id = self.find_id(path_hash(normalized))?;
        self.entry(id).map(|e| &e.descriptor)
    }

    /// Look up and reject a key owned by a different path.
    pub fn get_checked(&self, normalized: &str) -> Result<Option<&FileDescriptor>> {
        let key = path_hash(normalized);
        let Some(id) = self.find_id(key) else {
            return Ok(None);
        };
        let existing = self.full_path(id);
        if existing != normalized {
            return Err(Error::PathHashCollision {
                path: normalized.to_string(),
                existing,
                hash: key,
            });
        }
        Ok(self.entry(id).map(|e| &e.descriptor))
    }

    /// Insert or replace the descriptor for a path.
    pub fn upsert(&mut self, normalized: &str, descriptor: FileDescriptor) -> Result<Upsert> {
        let split =
            SplitPath::new(normalized).ok_or_else(|| Error::InvalidPath(normalized.to_string()))?;
        let key = path_hash(normalized);

        match self.index.binary_search_by_key(&key, |slot| slot.key) {
            Ok(pos) => {
                let id = self.index[pos].entry;
                let existing = self.full_path(id);
                if existing != normalized {
                    return Err(Error::PathHashCollision {
                        path: normalized.to_string(),
                        existing,
                        hash: key,
                    });
                }
                if let Some(Some(entry)) = self.entries.get_mut(id as usize) {
                    entry.descriptor = descriptor;
                }
                Ok(Upsert::Replaced)
            }
            Err(pos) => {
                let id = self.push_entry(split, descriptor);
                self.index.insert(pos, IndexSlot { key, entry: id });
                Ok(Upsert::Inserted)
            }
        }
    }

    /// Remove a path. Returns whether it was present.
    pub fn remove(&mut self, normalized: &str) -> bool {
        let key = path_hash(normalized);
        let Ok(pos) = self.index.binary_search_by_key(&key, |slot| slot.key) else {
            return false;
        };
        let id = self.index.remove(pos).entry;

        if let Some(entry) = self.entries.get_mut(id as usize).and_then(Option::take) {
            if let Some(group) = self.paths.get_mut(entry.path_group as usize) {
                group.files.retain(|&f| f != id);
            }
            self.free.push(id);
        }
        true
    }

    /// Full normalized path of an entry.
    fn full_path(&self, id: u32) -> String {
        let Some(entry) = self.entry(id) else {
            return String::new();
        };
        let group = &self.paths[entry.path_group as usize];
        let ext = &self.extensions[group.extension as usize].name;
        SplitPath::join(&group.name, &entry.base, ext)
    }

    /// Entries in tree order.
    pub fn iter(&self) -> impl Iterator<Item = (String, &FileDescriptor)> + '_ {
        self.extensions.iter().flat_map(move |ext| {
            ext.paths.iter().flat_map(move |&p| {
                let group = &self.paths[p as usize];
                group.files.iter().filter_map(move |&id| {
                    self.entry(id).map(|e| {
                        (
                            SplitPath::join(&group.name, &e.base, &ext.name),
                            &e.descriptor,
                        )
                    })
                })
            })
        })
    }

    /// Every part of every live entry.
    pub fn parts(&self) -> impl Iterator<Item = &FilePart> + '_ {
        self.entries
            .iter()
            .flatten()
            .flat_map(|e| e.descriptor.parts().iter())
    }

    fn entry(&self, id: u32) -> Option<&DirEntry> {
        self.entries.get(id as usize).and_then(Option::as_ref)
    }

    fn find_id(&self, key: u32) -> Option<u32> {
        self.index
            .binary_search_by_key(&key, |slot| slot.key)
            .ok()
            .map(|pos| self.index[pos].entry)
    }

    fn group_for(&mut self, ext: &str, dir: &str) -> u32 {
        let extension = match self.extension_lookup.get(ext) {
            Some(&e) => e,
            None => {
                let e = self.extensions.len() as u32;
                self.extensions.push(ExtensionGroup {
                    name: ext.to_string(),
                    paths: Vec::new(),
                });
                self.extension_lookup.insert(ext.to_string(), e);
                e
            }
        };

        let lookup_key = (extension, dir.to_string());
        if let Some(&p) = self.path_lookup.get(&lookup_key) {
            return p;
        }

        let p = self.paths.len() as u32;
        self.paths.push(PathGroup {
            extension,
            name: dir.to_string(),
            files: Vec::new(),
        });
        self.extensions[extension as usize].paths.push(p);
        self.path_lookup.insert(lookup_key, p);
        p
    }

    fn push_entry(&mut self, split: SplitPath<'_>, descriptor: FileDescriptor) -> u32 {
        let path_group = self.group_for(split.ext, split.dir);
        let entry = DirEntry {
            base: split.base.to_string(),
            path_group,
            descriptor,
        };

        let id = match self.free.pop() {
            Some(id) => {
                self.entries[id as usize] = Some(entry);
                id
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };
        self.paths[path_group as usize].files.push(id);
        id
    }

    /// Serialize the tree section.
    pub fn serialize_tree(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new(Vec::with_capacity(self.len() * 48));

        for ext in &self.extensions {
            let live = |p: &&u32| !self.paths[**p as usize].files.is_empty();
            if !ext.paths.iter().any(|p| live(&p)) {
                continue;
            }
            writer.write_cstring(placeholder(&ext.name))?;

            for &p in ext.paths.iter().filter(live) {
                let group = &self.paths[p as usize];
                writer.write_cstring(placeholder(&group.name))?;

                for &id in &group.files {
                    let Some(entry) = self.entry(id) else {
                        continue;
                    };
                    write_entry(&mut writer, entry)?;
                }
                writer.write_cstring("")?;
            }
            writer.write_cstring("")?;
        }
        writer.write_cstring("")?;

        Ok(writer.into_inner())
    }

    /// Parse a tree section. Duplicate keys are a hard failure.
    pub fn parse_tree(data: &[u8]) -> Result<Self> {
        let mut dir = Self::new();
        let mut reader = BinaryReader::new(data);

        loop {
            let ext = reader.read_cstring()?;
            if ext.is_empty() {
                break;
            }
            let ext = from_placeholder(ext);

            loop {
                let path = reader.read_cstring()?;
                if path.is_empty() {
                    break;
                }
                let path = from_placeholder(path);

                loop {
                    let base = reader.read_cstring()?;
                    if base.is_empty() {
                        break;
                    }
                    let descriptor = read_entry(&mut reader)?;
                    let split = SplitPath { dir: path, base, ext };
                    let full = SplitPath::join(path, base, ext);
                    if SplitPath::new(&full).is_none() {
                        return Err(Error::MalformedDirectory(format!(
                            "unstorable path {full:?} in tree"
                        )));
                    }
                    let key = path_hash(&full);
                    let id = dir.push_entry(split, descriptor);
                    dir.index.push(IndexSlot { key, entry: id });
                }
            }
        }

        if !reader.is_empty() {
            return Err(Error::MalformedDirectory(format!(
                "{} trailing bytes after tree terminator",
                reader.remaining()
            )));
        }

        dir.index.sort_unstable_by_key(|slot| slot.key);
        if let Some(pair) = dir.index.windows(2).find(|w| w[0].key == w[1].key) {
            return Err(Error::PathHashCollision {
                path: dir.full_path(pair[1].entry),
                existing: dir.full_path(pair[0].entry),
                hash: pair[0].key,
            });
        }

        Ok(dir)
    }
}

fn placeholder(name: &str) -> &str {
    if name.is_empty() {
        EMPTY_NAME
    } else {
        name
    }
}

fn from_placeholder(name: &str) -> &str {
    if name == EMPTY_NAME {
        ""
    } else {
        name
    }
}

fn write_entry(writer: &mut BinaryWriter<Vec<u8>>, entry: &DirEntry) -> Result<()> {
    let desc = &entry.descriptor;
    writer.write_cstring(&entry.base)?;
    writer.write_u32(desc.crc())?;
    let preload_size = u16::try_from(desc.preload().len()).map_err(|_| Error::PreloadTooLarge {
        size: desc.preload().len(),
        limit: u16::MAX as usize,
    })?;
    writer.write_u16(preload_size)?;
    for part in desc.parts() {
        writer.write_u16(part.chunk)?;
        writer.write_u32(part.offset)?;
        writer.write_u32(part.length)?;
    }
    writer.write_u16(PART_TERMINATOR)?;
    writer.write_bytes(desc.preload())?;
    Ok(())
}

fn read_entry(reader: &mut BinaryReader<'_>) -> Result<FileDescriptor> {
    let crc = reader.read_u32()?;
    let preload_size = reader.read_u16()? as usize;

    let mut parts = Vec::with_capacity(1);
    loop {
        let chunk = reader.read_u16()?;
        if chunk == PART_TERMINATOR {
            break;
        }
        let offset = reader.read_u32()?;
        let length = reader.read_u32()?;
        parts.push(FilePart {
            chunk,
            offset,
            length,
        });
    }

    let preload = reader.read_bytes(preload_size)?.to_vec();
    Ok(FileDescriptor::new(crc, preload, parts))
}
