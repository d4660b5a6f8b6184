//! Filesystem scanner.
//!
//! Walks a real directory tree and stores it as directory blobs. File
//! contents are hashed and inserted through the storage layer; when a
//! previous snapshot of the same tree is available, its per-directory
//! digests serve as hints and files whose name, size and modification
//! time are unchanged reuse the prior content digest without being
//! read again.

use std::collections::HashSet;
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};

use nix::sys::stat::{major, minor};
use pathpatterns::{MatchEntry, MatchList, MatchType};
use serde_json::Map;

use casbak_store::{CasFs, DirEntry, Directory, EntryKind, EntryStat};

#[derive(Default)]
pub struct ImportStats {
    pub directories: u64,
    pub files: u64,
    pub reused_files: u64,
    pub bytes_stored: u64,
    pub skipped: u64,
}

pub struct Scanner<'a> {
    fs: &'a CasFs,
    patterns: Vec<MatchEntry>,
    /// Path of the currently scanned entry relative to the import
    /// root, used for pattern matching and diagnostics.
    path: Vec<u8>,
    stats: ImportStats,
}

fn stat_from_metadata(metadata: &Metadata) -> EntryStat {
    EntryStat {
        size: Some(metadata.len()),
        create_ts: None,
        modify_ts: Some(metadata.mtime()),
        uid: Some(metadata.uid()),
        gid: Some(metadata.gid()),
        user: None,
        group: None,
        mode: Some(metadata.mode() & 0o7777),
        atime: Some(metadata.atime()),
        ctime: Some(metadata.ctime()),
        dev: Some(metadata.dev()),
        inode: Some(metadata.ino()),
        nlink: Some(metadata.nlink()),
        blocksize: Some(metadata.blksize()),
        blocks: Some(metadata.blocks()),
    }
}

impl<'a> Scanner<'a> {
    pub fn new(fs: &'a CasFs, patterns: Vec<MatchEntry>) -> Self {
        Self {
            fs,
            patterns,
            path: Vec::new(),
            stats: ImportStats::default(),
        }
    }

    pub fn into_stats(self) -> ImportStats {
        self.stats
    }

    /// Store the directory at `dir_path` and return its digest.
    ///
    /// `dir_hint` is the digest of this directory in a previous
    /// snapshot; an unusable hint only costs the optimization.
    pub fn store_dir(&mut self, dir_path: &Path, dir_hint: Option<&str>) -> Result<String, Error> {
        let hint: Option<Arc<Directory>> = match dir_hint {
            Some(digest) => match self.fs.get_dir(digest) {
                Ok(dir) => dir,
                Err(err) => {
                    log::warn!("ignoring unusable directory hint - {}", err);
                    None
                }
            },
            None => None,
        };

        let mut children: Vec<(Vec<u8>, PathBuf)> = Vec::new();
        for item in std::fs::read_dir(dir_path)
            .map_err(|err| format_err!("unable to read directory {:?} - {}", dir_path, err))?
        {
            let item = item?;
            children.push((item.file_name().as_bytes().to_vec(), item.path()));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (name, child_path) in children {
            let path_len = self.path.len();
            self.path.push(b'/');
            self.path.extend_from_slice(&name);
            let child = self.store_child(&name, &child_path, hint.as_deref());
            self.path.truncate(path_len);

            if let Some(entry) = child? {
                if self.fs.case_insensitive()
                    && !seen.insert(entry.name.to_ascii_lowercase())
                {
                    bail!(
                        "case folded duplicate name {:?} in {:?}",
                        String::from_utf8_lossy(&entry.name),
                        dir_path
                    );
                }
                entries.push(entry);
            }
        }

        let digest = self.fs.store_directory(&entries, &Map::new())?;
        self.stats.directories += 1;
        Ok(digest)
    }

    fn store_child(
        &mut self,
        name: &[u8],
        path: &Path,
        hint: Option<&Directory>,
    ) -> Result<Option<DirEntry>, Error> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                log::warn!("skipping {:?} - {}", path, err);
                self.stats.skipped += 1;
                return Ok(None);
            }
        };

        if matches!(
            self.patterns.matches(&self.path, Some(metadata.mode())),
            Ok(Some(MatchType::Exclude))
        ) {
            log::debug!("excluding {:?}", path);
            self.stats.skipped += 1;
            return Ok(None);
        }

        let file_type = metadata.file_type();
        let mut entry = if file_type.is_dir() {
            let child_hint = hint
                .and_then(|dir| dir.find_entry(name, false))
                .filter(|prev| prev.is_directory())
                .and_then(|prev| prev.digest_ref())
                .map(str::to_owned);
            let digest = self.store_dir(path, child_hint.as_deref())?;
            let mut entry = DirEntry::new(EntryKind::Directory, name.to_vec());
            entry.reference = Some(digest.into_bytes());
            entry
        } else if file_type.is_file() {
            let mut entry = DirEntry::new(EntryKind::File, name.to_vec());
            entry.reference = match self.reusable_digest(name, &metadata, hint) {
                Some(digest) => {
                    self.stats.reused_files += 1;
                    Some(digest.into_bytes())
                }
                None => match self.fs.put_file(path) {
                    Ok(digest) => {
                        self.stats.bytes_stored += metadata.len();
                        Some(digest.into_bytes())
                    }
                    Err(err) => {
                        log::warn!("skipping {:?} - {}", path, err);
                        self.stats.skipped += 1;
                        return Ok(None);
                    }
                },
            };
            self.stats.files += 1;
            entry
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(path)
                .map_err(|err| format_err!("unable to read symlink {:?} - {}", path, err))?;
            let mut entry = DirEntry::new(EntryKind::Symlink, name.to_vec());
            entry.reference = Some(target.as_os_str().as_bytes().to_vec());
            entry
        } else if file_type.is_block_device() || file_type.is_char_device() {
            let kind = if file_type.is_block_device() {
                EntryKind::BlockDevice
            } else {
                EntryKind::CharDevice
            };
            let mut entry = DirEntry::new(kind, name.to_vec());
            let rdev = metadata.rdev();
            entry.reference = Some(format!("{}:{}", major(rdev), minor(rdev)).into_bytes());
            entry
        } else if file_type.is_fifo() {
            DirEntry::new(EntryKind::Fifo, name.to_vec())
        } else if file_type.is_socket() {
            DirEntry::new(EntryKind::Socket, name.to_vec())
        } else {
            log::warn!("skipping {:?} - unsupported file type", path);
            self.stats.skipped += 1;
            return Ok(None);
        };

        entry.stat = stat_from_metadata(&metadata);
        Ok(Some(entry))
    }

    /// The previous content digest, if name, size and mtime match.
    fn reusable_digest(
        &self,
        name: &[u8],
        metadata: &Metadata,
        hint: Option<&Directory>,
    ) -> Option<String> {
        let prev = hint?.find_entry(name, false)?;
        if prev.kind == EntryKind::File
            && prev.stat.size == Some(metadata.len())
            && prev.stat.modify_ts == Some(metadata.mtime())
        {
            prev.digest_ref().map(str::to_owned)
        } else {
            None
        }
    }
}

/// Import a real directory tree and return the new root entry.
pub fn import_tree(
    fs: &CasFs,
    source: &Path,
    previous_root: Option<&DirEntry>,
    patterns: Vec<MatchEntry>,
) -> Result<(DirEntry, ImportStats), Error> {
    let metadata = std::fs::metadata(source)
        .map_err(|err| format_err!("unable to access {:?} - {}", source, err))?;
    if !metadata.is_dir() {
        bail!("import source {:?} is not a directory", source);
    }

    let hint = previous_root
        .and_then(|entry| entry.digest_ref())
        .map(str::to_owned);

    let mut scanner = Scanner::new(fs, patterns);
    let digest = scanner.store_dir(source, hint.as_deref())?;

    let mut root = DirEntry::new(EntryKind::Directory, Vec::new());
    root.reference = Some(digest.into_bytes());
    root.stat = stat_from_metadata(&metadata);
    Ok((root, scanner.into_stats()))
}
