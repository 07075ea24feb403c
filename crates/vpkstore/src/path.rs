//! Logical path normalization.
//!
//! Directory keys are derived from the normalized form: lower-cased, forward
//! slashes only, no leading `./` or `/`, no empty components.

use vpkstore_common::crc;

use crate::format::EMPTY_NAME;

/// Normalize a logical path.
///
/// ```
/// assert_eq!(vpkstore::path::normalize("Models\\Props//X.MDL"), "models/props/x.mdl");
/// assert_eq!(vpkstore::path::normalize("./materials/x.vmt"), "materials/x.vmt");
/// ```
pub fn normalize(name: &str) -> String {
    let lowered = name.to_lowercase().replace('\\', "/");
    let mut out = String::with_capacity(lowered.len());

    for component in lowered.split('/') {
        if component.is_empty() || component == "." {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(component);
    }

    // Preserve a trailing slash so directory-like names stay detectable.
    if lowered.ends_with('/') && !out.is_empty() {
        out.push('/');
    }

    out
}

/// Directory key of an already normalized path.
#[inline]
pub fn path_hash(normalized: &str) -> u32 {
    crc::path_key(normalized)
}

/// A normalized path split into its tree components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPath<'a> {
    /// Parent directory, empty for the root.
    pub dir: &'a str,
    /// File name without extension.
    pub base: &'a str,
    /// Extension without the dot, empty if none.
    pub ext: &'a str,
}

impl<'a> SplitPath<'a> {
    /// Split a normalized path.
    ///
    /// Returns `None` for paths that name a directory, climb out of the root
    /// with `..`, or whose directory or extension is the tree's empty-name
    /// placeholder.
    pub fn new(normalized: &'a str) -> Option<Self> {
        if normalized.is_empty() || normalized.ends_with('/') {
            return None;
        }
        if normalized.split('/').any(|c| c == "..") {
            return None;
        }

        let (dir, file) = match normalized.rfind('/') {
            Some(i) => (&normalized[..i], &normalized[i + 1..]),
            None => ("", normalized),
        };

        // A leading or trailing dot is part of the base name.
        let (base, ext) = match file.rfind('.') {
            Some(i) if i > 0 && i + 1 < file.len() => (&file[..i], &file[i + 1..]),
            _ => (file, ""),
        };

        if dir == EMPTY_NAME || ext == EMPTY_NAME {
            return None;
        }

        Some(Self { dir, base, ext })
    }

    /// Reassemble the normalized path.
    pub fn join(dir: &str, base: &str, ext: &str) -> String {
        let mut out = String::with_capacity(dir.len() + base.len() + ext.len() + 2);
        if !dir.is_empty() {
            out.push_str(dir);
            out.push('/');
        }
        out.push_str(base);
        if !ext.is_empty() {
            out.push('.');
            out.push_str(ext);
        }
        out
    }
}
