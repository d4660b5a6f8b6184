//! Path facade.
//!
//! A [VPath] bundles a filesystem reference with an unresolved name
//! sequence. It carries no state of its own; every accessor resolves on
//! demand.

use anyhow::format_err;

use crate::cas::CasFile;
use crate::dir_entry::{DirEntry, EntryKind};
use crate::error::FsError;
use crate::filesystem::CasFs;
use crate::resolve::ResolveOpts;

/// Split a textual path into name components.
///
/// The leading component is always the (empty) volume name; `"/a/b"`,
/// `"a/b"` and `"./a/b"` all address the same entries.
pub fn path_names(path: &str) -> Vec<Vec<u8>> {
    let mut names: Vec<Vec<u8>> = path
        .split('/')
        .map(|component| component.as_bytes().to_vec())
        .collect();
    if names.first().map(Vec::is_empty) != Some(true) {
        names.insert(0, Vec::new());
    }
    names
}

#[derive(Clone)]
pub struct VPath<'a> {
    fs: &'a CasFs,
    names: Vec<Vec<u8>>,
}

impl<'a> VPath<'a> {
    pub(crate) fn new(fs: &'a CasFs, names: Vec<Vec<u8>>) -> Self {
        Self { fs, names }
    }

    pub fn names(&self) -> &[Vec<u8>] {
        &self.names
    }

    /// Extend the path by further components.
    pub fn subpath(&self, more: &[Vec<u8>]) -> VPath<'a> {
        let mut names = self.names.clone();
        names.extend(more.iter().cloned());
        VPath {
            fs: self.fs,
            names,
        }
    }

    /// Resolve to the entry list along the path.
    pub fn resolve(&self) -> Result<Vec<DirEntry>, FsError> {
        self.fs.resolve_path(&self.names, &ResolveOpts::default())
    }

    /// Resolve with explicit flags.
    pub fn resolve_with(&self, opts: &ResolveOpts) -> Result<Vec<DirEntry>, FsError> {
        self.fs.resolve_path(&self.names, opts)
    }

    /// The final entry of the resolved path.
    pub fn entry(&self) -> Result<DirEntry, FsError> {
        let mut entries = self.resolve()?;
        entries
            .pop()
            .ok_or_else(|| FsError::Other(format_err!("empty path")))
    }

    /// The type of the final entry.
    pub fn kind(&self) -> Result<EntryKind, FsError> {
        Ok(self.entry()?.kind)
    }

    /// Open the blob behind a file entry.
    pub fn open(&self) -> Result<CasFile, FsError> {
        let entry = self.entry()?;
        if entry.kind != EntryKind::File {
            return Err(FsError::Other(format_err!(
                "not a regular file: {:?}",
                String::from_utf8_lossy(&entry.name)
            )));
        }
        let digest = entry
            .digest_ref()
            .ok_or_else(|| FsError::Other(format_err!("file entry has no content reference")))?;
        self.fs.get(digest)?.ok_or_else(|| {
            FsError::Other(format_err!("file blob '{}' is not in storage", digest))
        })
    }
}

#[test]
fn test_path_names() {
    assert_eq!(path_names(""), vec![Vec::<u8>::new()]);
    assert_eq!(path_names("/a/b"), vec![b"".to_vec(), b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(path_names("a/b"), vec![b"".to_vec(), b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(path_names("/"), vec![b"".to_vec(), b"".to_vec()]);
}
