//! Wildcard listings of directory contents.

use std::collections::BTreeSet;

use glob::{MatchOptions, Pattern};

use crate::directory::Directory;
use crate::path::normalize;
use crate::Result;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Files and the directories that contain them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAndDirLists {
    /// Every ancestor directory of a listed file, without a trailing slash.
    pub directories: Vec<String>,
    /// Normalized file paths.
    pub files: Vec<String>,
}

impl FileAndDirLists {
    /// Files directly inside `dir`. The root is `""`.
    pub fn files_in<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.files.iter().map(String::as_str).filter(move |f| match f.rfind('/') {
            Some(i) => &f[..i] == dir,
            None => dir.is_empty(),
        })
    }
}

fn compile(wildcard: Option<&str>) -> Result<Option<Pattern>> {
    match wildcard {
        None | Some("") | Some("*") => Ok(None),
        Some(w) => Ok(Some(Pattern::new(&normalize(w))?)),
    }
}

/// Normalized names in tree order, optionally filtered by a glob.
pub(crate) fn file_list(dir: &Directory, wildcard: Option<&str>) -> Result<Vec<String>> {
    let pattern = compile(wildcard)?;
    Ok(dir
        .iter()
        .map(|(name, _)| name)
        .filter(|name| {
            pattern
                .as_ref()
                .map_or(true, |p| p.matches_with(name, MATCH_OPTIONS))
        })
        .collect())
}

pub(crate) fn file_and_dir_lists(
    dir: &Directory,
    wildcard: Option<&str>,
    sorted: bool,
) -> Result<FileAndDirLists> {
    let mut files = file_list(dir, wildcard)?;

    let mut seen = BTreeSet::new();
    let mut directories = Vec::new();
    for file in &files {
        let mut end = 0;
        while let Some(i) = file[end..].find('/') {
            end += i;
            let parent = &file[..end];
            if seen.insert(parent.to_string()) {
                directories.push(parent.to_string());
            }
            end += 1;
        }
    }

    if sorted {
        files.sort_unstable();
        directories.sort_unstable();
    }

    Ok(FileAndDirLists { directories, files })
}
