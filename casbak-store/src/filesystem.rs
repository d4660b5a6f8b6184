//! The CAS backed virtual filesystem.
//!
//! A filesystem instance owns a storage handle, the current root entry
//! and an overlay of pending edits. The committed tree is immutable:
//! every edit lands in the overlay first and only [CasFs::commit] folds
//! it into new directory blobs, yielding a new root digest. Unchanged
//! subtrees keep their digests, which is what makes snapshots cheap.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::format_err;
use serde_json::{Map, Value};

use crate::cas::{CasFile, CasStore};
use crate::dir_cache::{DirCache, DEFAULT_CACHE_CAPACITY};
use crate::dir_codec;
use crate::dir_entry::{fold_key, DirEntry, EntryKind, EntryPatch, EntryStat};
use crate::directory::Directory;
use crate::error::FsError;
use crate::file_formats::DEFAULT_FORMAT;
use crate::resolve::{resolve_nodes, ResolveOpts};
use crate::vpath::VPath;

/// A pending edit below a directory level of the overlay.
///
/// `Deleted` marks an unlinked child and shadows any same-named entry
/// of the underlying committed directory.
pub(crate) enum OverlayChild {
    Deleted,
    Node(OverlayNode),
}

/// One level of the overlay tree.
pub(crate) struct OverlayNode {
    /// The effective entry at this level.
    pub entry: DirEntry,
    /// The decoded committed directory this node overrides, if it was
    /// materialized on the way here. Saves a decode at commit time.
    pub dir: Option<Arc<Directory>>,
    /// Pending children, keyed by (case folded) name.
    pub subtree: HashMap<Vec<u8>, OverlayChild>,
}

impl OverlayNode {
    fn new(entry: DirEntry, dir: Option<Arc<Directory>>) -> Self {
        Self {
            entry,
            dir,
            subtree: HashMap::new(),
        }
    }
}

struct FsState {
    root_entry: DirEntry,
    overlay: Option<OverlayNode>,
}

/// Construction options for [CasFs].
pub struct FsOptions {
    /// Fold lookup keys (stored names keep their case).
    pub case_insensitive: bool,
    /// Format tag of the codec used for newly written directories.
    pub format: String,
    /// Size of the strong reference ring of the directory cache.
    pub cache_capacity: usize,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            case_insensitive: false,
            format: DEFAULT_FORMAT.to_string(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Virtual filesystem over a content addressable store.
///
/// The filesystem itself is not internally synchronized beyond basic
/// memory safety; concurrent use has to be arranged by the embedder,
/// typically one instance per thread over a shared store.
pub struct CasFs {
    cas: Arc<dyn CasStore>,
    case_insensitive: bool,
    default_format: String,
    empty_dir_digest: String,
    state: Mutex<FsState>,
    cache: Mutex<DirCache>,
}

impl CasFs {
    /// Create a filesystem over `cas`.
    ///
    /// `root_entry` names the snapshot to operate on; without one the
    /// filesystem starts out as a single empty volume. The digest of
    /// the empty directory is computed (and its blob stored) up front,
    /// so that later writes producing empty directories can reuse it
    /// without re-serializing.
    pub fn new(
        cas: Arc<dyn CasStore>,
        root_entry: Option<DirEntry>,
        options: FsOptions,
    ) -> Result<Self, FsError> {
        if dir_codec::lookup_codec(&options.format).is_none() {
            return Err(FsError::UnsupportedFormat(format!(
                "unknown format tag {:?}",
                options.format
            )));
        }

        let empty_blob = dir_codec::serialize_dir(&options.format, &[], &Map::new())?;
        let empty_dir_digest = cas.put_scalar(&empty_blob)?;

        let root_entry = match root_entry {
            Some(entry) => {
                if !entry.is_directory() {
                    return Err(FsError::Other(format_err!(
                        "root entry must be a directory"
                    )));
                }
                entry
            }
            None => {
                let mut entry = DirEntry::new(EntryKind::Directory, Vec::new());
                entry.reference = Some(empty_dir_digest.clone().into_bytes());
                entry
            }
        };

        Ok(Self {
            cas,
            case_insensitive: options.case_insensitive,
            default_format: options.format,
            empty_dir_digest,
            state: Mutex::new(FsState {
                root_entry,
                overlay: None,
            }),
            cache: Mutex::new(DirCache::new(options.cache_capacity)),
        })
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// Format tag used for newly written directories.
    pub fn default_format(&self) -> &str {
        &self.default_format
    }

    /// The precomputed digest of the empty directory.
    pub fn hash_of_empty_dir(&self) -> &str {
        &self.empty_dir_digest
    }

    /// The current root entry (the name of the current snapshot).
    pub fn root_entry(&self) -> DirEntry {
        self.state.lock().unwrap().root_entry.clone()
    }

    /// Replace the root entry, discarding any pending overlay.
    pub fn set_root_entry(&self, entry: DirEntry) -> Result<(), FsError> {
        if !entry.is_directory() {
            return Err(FsError::Other(format_err!("root entry must be a directory")));
        }
        let mut state = self.state.lock().unwrap();
        state.root_entry = entry;
        state.overlay = None;
        Ok(())
    }

    /// The underlying storage handle.
    pub fn store(&self) -> &dyn CasStore {
        self.cas.as_ref()
    }

    /// Open a blob for reading (storage passthrough).
    pub fn get(&self, digest: &str) -> Result<Option<CasFile>, FsError> {
        self.cas.get(digest)
    }

    /// Store a blob (storage passthrough).
    pub fn put_scalar(&self, data: &[u8]) -> Result<String, FsError> {
        self.cas.put_scalar(data)
    }

    /// Store a file's content (storage passthrough).
    pub fn put_file(&self, path: &Path) -> Result<String, FsError> {
        self.cas.put_file(path)
    }

    /// Store a reader's content (storage passthrough).
    pub fn put_handle(&self, reader: &mut dyn Read) -> Result<String, FsError> {
        self.cas.put_handle(reader)
    }

    /// Fetch a directory object, decoding at most once.
    ///
    /// Returns the cached object if one is still live, otherwise decodes
    /// the blob, caches the result and returns it. `None` means the
    /// store has no blob under this digest; a stored blob that fails to
    /// decode is a [FsError::BadDirectoryBlob].
    pub fn get_dir(&self, digest: &str) -> Result<Option<Arc<Directory>>, FsError> {
        if let Some(dir) = self.cache.lock().unwrap().get(digest) {
            return Ok(Some(dir));
        }

        let mut file = match self.cas.get(digest)? {
            Some(file) => file,
            None => return Ok(None),
        };
        let blob = file.read_all()?;
        let dir = Arc::new(dir_codec::deserialize_dir(&blob, digest)?);

        self.cache.lock().unwrap().put(Arc::clone(&dir));
        Ok(Some(dir))
    }

    /// Serialize a directory with the default codec and store the blob.
    ///
    /// This is the write entry point for scanners; it additionally
    /// enforces the active case policy on entry names.
    pub fn store_directory(
        &self,
        entries: &[DirEntry],
        metadata: &Map<String, Value>,
    ) -> Result<String, FsError> {
        let blob = self.build_dir_blob(&self.default_format, entries, metadata)?;
        self.cas.put_scalar(&blob)
    }

    fn build_dir_blob(
        &self,
        format: &str,
        entries: &[DirEntry],
        metadata: &Map<String, Value>,
    ) -> Result<Vec<u8>, FsError> {
        if self.case_insensitive {
            let mut seen = std::collections::HashSet::new();
            for entry in entries {
                if !seen.insert(fold_key(&entry.name, true)) {
                    return Err(FsError::DuplicateName(entry.name.clone().into()));
                }
            }
        }
        dir_codec::serialize_dir(format, entries, metadata)
    }

    /// Resolve a path to the list of entries along it.
    ///
    /// The first name is the volume (the root entry's name, usually
    /// empty). Pending overlay edits are visible; the committed tree is
    /// never modified.
    pub fn resolve_path(
        &self,
        names: &[Vec<u8>],
        opts: &ResolveOpts,
    ) -> Result<Vec<DirEntry>, FsError> {
        let state = self.state.lock().unwrap();
        let nodes = resolve_nodes(self, &state.root_entry, state.overlay.as_ref(), names, opts)?;
        Ok(nodes.into_iter().map(|node| node.entry).collect())
    }

    /// Install a pending override at `names`.
    ///
    /// `entry` is the new effective entry (its name is forced to the
    /// resolved final component); `None` marks the child as deleted.
    /// Nothing is written to storage until [CasFs::commit].
    pub fn set_path(
        &self,
        names: &[Vec<u8>],
        entry: Option<DirEntry>,
        opts: &ResolveOpts,
    ) -> Result<(), FsError> {
        let mut opts = opts.clone();
        opts.partial = true;

        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let resolved: Vec<(DirEntry, Option<Arc<Directory>>)> =
            resolve_nodes(self, &state.root_entry, state.overlay.as_ref(), names, &opts)?
                .into_iter()
                .map(|node| (node.entry, node.dir))
                .collect();
        if resolved.len() < 2 {
            return Err(FsError::Other(format_err!(
                "refusing to replace the filesystem root"
            )));
        }

        let parent = Self::overlay_walk(state, self.case_insensitive, &resolved);
        let (final_entry, final_dir) = resolved.last().unwrap();
        let key = fold_key(&final_entry.name, self.case_insensitive);

        match entry {
            None => {
                parent.subtree.insert(key, OverlayChild::Deleted);
            }
            Some(mut new_entry) => {
                new_entry.name = final_entry.name.clone();
                // a wholesale replacement drops pending edits below the
                // old entry
                let dir = match new_entry.reference == final_entry.reference {
                    true => final_dir.clone(),
                    false => None,
                };
                parent
                    .subtree
                    .insert(key, OverlayChild::Node(OverlayNode::new(new_entry, dir)));
            }
        }
        Ok(())
    }

    /// Clone the effective entry at `names` with `patch` applied and
    /// install the result as a pending override.
    pub fn update_path(
        &self,
        names: &[Vec<u8>],
        patch: &EntryPatch,
        opts: &ResolveOpts,
    ) -> Result<(), FsError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let resolved: Vec<(DirEntry, Option<Arc<Directory>>)> =
            resolve_nodes(self, &state.root_entry, state.overlay.as_ref(), names, opts)?
                .into_iter()
                .map(|node| (node.entry, node.dir))
                .collect();
        if resolved.len() < 2 {
            return Err(FsError::Other(format_err!(
                "refusing to replace the filesystem root"
            )));
        }

        let parent = Self::overlay_walk(state, self.case_insensitive, &resolved);
        let (final_entry, final_dir) = resolved.last().unwrap();
        let key = fold_key(&final_entry.name, self.case_insensitive);
        let new_entry = final_entry.with_patch(patch);

        // the entry keeps its identity, so pending edits below it survive
        let (subtree, dir) = match parent.subtree.remove(&key) {
            Some(OverlayChild::Node(node)) => (node.subtree, node.dir),
            _ => (HashMap::new(), final_dir.clone()),
        };
        parent.subtree.insert(
            key,
            OverlayChild::Node(OverlayNode {
                entry: new_entry,
                dir,
                subtree,
            }),
        );
        Ok(())
    }

    /// Walk the overlay along `resolved`, creating nodes as needed, and
    /// return the node for the second-to-last level.
    fn overlay_walk<'a>(
        state: &'a mut FsState,
        case_insensitive: bool,
        resolved: &[(DirEntry, Option<Arc<Directory>>)],
    ) -> &'a mut OverlayNode {
        if state.overlay.is_none() {
            state.overlay = Some(OverlayNode::new(
                state.root_entry.clone(),
                resolved[0].1.clone(),
            ));
        }
        // unwrap: installed right above
        let overlay = state.overlay.as_mut().unwrap();
        if overlay.dir.is_none() {
            overlay.dir = resolved[0].1.clone();
        }

        let mut current = overlay;
        for (entry, dir) in &resolved[1..resolved.len() - 1] {
            let key = fold_key(&entry.name, case_insensitive);
            let child = current
                .subtree
                .entry(key)
                .or_insert_with(|| OverlayChild::Node(OverlayNode::new(entry.clone(), dir.clone())));
            if matches!(child, OverlayChild::Deleted) {
                *child = OverlayChild::Node(OverlayNode::new(entry.clone(), dir.clone()));
            }
            let node = match child {
                OverlayChild::Node(node) => node,
                OverlayChild::Deleted => unreachable!(),
            };
            if node.dir.is_none() {
                node.dir = dir.clone();
            }
            current = node;
        }
        current
    }

    /// Create a directory, fabricating missing parents.
    ///
    /// An existing directory at `names` is left alone.
    pub fn mkdir(&self, names: &[Vec<u8>]) -> Result<(), FsError> {
        match self.resolve_path(names, &ResolveOpts::default()) {
            Ok(entries) => match entries.last() {
                Some(entry) if entry.is_directory() => Ok(()),
                Some(entry) => Err(FsError::NotADirectory(entry.name.clone().into())),
                None => Err(FsError::Other(format_err!("empty path"))),
            },
            Err(FsError::NoSuchEntry(_)) | Err(FsError::DirectoryNotInStorage(_)) => {
                let entry = DirEntry::new(EntryKind::Directory, Vec::new());
                self.set_path(names, Some(entry), &ResolveOpts::mkdir(1))
            }
            Err(err) => Err(err),
        }
    }

    /// Create an empty file or update the modification time of an
    /// existing one.
    pub fn touch(&self, names: &[Vec<u8>]) -> Result<(), FsError> {
        let now = proxmox_time::epoch_i64();
        match self.resolve_path(names, &ResolveOpts::default()) {
            Ok(_) => {
                let patch = EntryPatch {
                    stat: EntryStat {
                        modify_ts: Some(now),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                self.update_path(names, &patch, &ResolveOpts::default())
            }
            Err(FsError::NoSuchEntry(_)) | Err(FsError::DirectoryNotInStorage(_)) => {
                let mut entry = DirEntry::new(EntryKind::File, Vec::new());
                entry.reference = Some(self.cas.hash_of_null().as_bytes().to_vec());
                entry.stat.size = Some(0);
                entry.stat.modify_ts = Some(now);
                self.set_path(names, Some(entry), &ResolveOpts::default())
            }
            Err(err) => Err(err),
        }
    }

    /// Remove the entry at `names` (pending until commit).
    pub fn unlink(&self, names: &[Vec<u8>]) -> Result<(), FsError> {
        self.resolve_path(names, &ResolveOpts::default())?;
        self.set_path(names, None, &ResolveOpts::default())
    }

    /// True if there are uncommitted edits.
    pub fn has_pending(&self) -> bool {
        self.state.lock().unwrap().overlay.is_some()
    }

    /// Drop all pending edits. Returns whether there were any.
    pub fn rollback(&self) -> bool {
        self.state.lock().unwrap().overlay.take().is_some()
    }

    /// Fold the overlay into new directory blobs.
    ///
    /// Directories are rebuilt bottom-up: committed children are kept
    /// unless shadowed, deleted children are dropped, edited
    /// subdirectories recurse first and contribute their new digests.
    /// A directory that ends up empty reuses the precomputed empty
    /// digest. On success the root entry points at the new root blob
    /// and the overlay is gone; on error the overlay is left untouched,
    /// so no partial commit is ever observable.
    ///
    /// Returns the new root entry, or `None` if nothing was pending.
    pub fn commit(&self) -> Result<Option<DirEntry>, FsError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let overlay = match state.overlay.as_ref() {
            Some(overlay) => overlay,
            None => return Ok(None),
        };

        let digest = self.commit_node(overlay)?;

        let new_root = state
            .root_entry
            .with_reference(Some(digest.into_bytes()));
        state.root_entry = new_root.clone();
        state.overlay = None;
        Ok(Some(new_root))
    }

    fn commit_node(&self, node: &OverlayNode) -> Result<String, FsError> {
        // materialize the committed directory this node shadows
        let underlying = match &node.dir {
            Some(dir) => Some(Arc::clone(dir)),
            None => match node.entry.digest_ref() {
                Some(digest) => Some(self.get_dir(digest)?.ok_or_else(|| {
                    FsError::DirectoryNotInStorage(node.entry.name.clone().into())
                })?),
                None => None,
            },
        };

        let (format, metadata, base_entries) = match &underlying {
            Some(dir) => (
                dir.format().to_string(),
                dir.metadata().clone(),
                dir.entries().to_vec(),
            ),
            None => (self.default_format.clone(), Map::new(), Vec::new()),
        };

        let mut entries: Vec<DirEntry> = base_entries
            .into_iter()
            .filter(|entry| {
                !node
                    .subtree
                    .contains_key(&fold_key(&entry.name, self.case_insensitive))
            })
            .collect();

        for child in node.subtree.values() {
            let child_node = match child {
                OverlayChild::Deleted => continue,
                OverlayChild::Node(child_node) => child_node,
            };
            let entry = if child_node.entry.is_directory()
                && (!child_node.subtree.is_empty() || child_node.entry.reference.is_none())
            {
                let digest = self.commit_node(child_node)?;
                child_node
                    .entry
                    .with_reference(Some(digest.into_bytes()))
            } else {
                child_node.entry.clone()
            };
            entries.push(entry);
        }

        if entries.is_empty() {
            return Ok(self.empty_dir_digest.clone());
        }

        let blob = self.build_dir_blob(&format, &entries, &metadata)?;
        self.cas.put_scalar(&blob)
    }

    /// A path facade over this filesystem.
    pub fn path(&self, path: &str) -> VPath<'_> {
        VPath::new(self, crate::vpath::path_names(path))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cas::{content_digest, MemoryCasStore};
    use crate::dir_codec;
    use crate::vpath::path_names;

    fn memory_fs() -> CasFs {
        CasFs::new(
            Arc::new(MemoryCasStore::new()),
            None,
            FsOptions::default(),
        )
        .unwrap()
    }

    fn file_entry(fs: &CasFs, name: &[u8], content: &[u8]) -> DirEntry {
        let digest = fs.put_scalar(content).unwrap();
        let mut entry = DirEntry::new(EntryKind::File, name.to_vec());
        entry.reference = Some(digest.into_bytes());
        entry.stat.size = Some(content.len() as u64);
        entry
    }

    fn dir_entry_for(name: &[u8], digest: &str) -> DirEntry {
        let mut entry = DirEntry::new(EntryKind::Directory, name.to_vec());
        entry.reference = Some(digest.as_bytes().to_vec());
        entry
    }

    fn symlink_entry(name: &[u8], target: &[u8]) -> DirEntry {
        let mut entry = DirEntry::new(EntryKind::Symlink, name.to_vec());
        entry.reference = Some(target.to_vec());
        entry
    }

    /// Store `entries` as the committed root directory.
    fn commit_root(fs: &CasFs, entries: &[DirEntry]) {
        let digest = fs.store_directory(entries, &Map::new()).unwrap();
        fs.set_root_entry(dir_entry_for(b"", &digest)).unwrap();
    }

    #[test]
    fn test_empty_filesystem() {
        let fs = memory_fs();

        let blob = dir_codec::serialize_dir(DEFAULT_FORMAT, &[], &Map::new()).unwrap();
        assert_eq!(fs.hash_of_empty_dir(), fs.put_scalar(&blob).unwrap());

        let entries = fs.resolve_path(&path_names(""), &ResolveOpts::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_directory());
        assert_eq!(entries[0].digest_ref(), Some(fs.hash_of_empty_dir()));
    }

    #[test]
    fn test_commit_creates_file() {
        let fs = memory_fs();
        let content_ref = fs.put_scalar(b"file contents").unwrap();

        let mut entry = DirEntry::new(EntryKind::File, Vec::new());
        entry.reference = Some(content_ref.clone().into_bytes());
        fs.set_path(&path_names("/a"), Some(entry), &ResolveOpts::default())
            .unwrap();

        let root = fs.commit().unwrap().unwrap();
        assert!(!fs.has_pending());
        assert_eq!(root, fs.root_entry());

        let dir = fs.get_dir(root.digest_ref().unwrap()).unwrap().unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.entries()[0].name, b"a");
        assert_eq!(dir.entries()[0].kind, EntryKind::File);
        assert_eq!(dir.entries()[0].digest_ref(), Some(content_ref.as_str()));

        // the new root digest equals the digest of the directly
        // serialized directory
        let mut expected = DirEntry::new(EntryKind::File, b"a".to_vec());
        expected.reference = Some(content_ref.into_bytes());
        let blob = dir_codec::serialize_dir(DEFAULT_FORMAT, &[expected], &Map::new()).unwrap();
        assert_eq!(root.digest_ref().unwrap(), content_digest(&blob));
    }

    #[test]
    fn test_symlink_resolution() {
        let fs = memory_fs();

        let x = file_entry(&fs, b"x", b"x data");
        let target_digest = fs.store_directory(&[x], &Map::new()).unwrap();
        commit_root(
            &fs,
            &[
                symlink_entry(b"link", b"/target"),
                dir_entry_for(b"target", &target_digest),
            ],
        );

        let entries = fs
            .resolve_path(&path_names("/link/x"), &ResolveOpts::default())
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].name, b"target");
        assert_eq!(entries[2].name, b"x");

        // trailing empty component forces resolution of the final entry
        let entries = fs
            .resolve_path(&path_names("/link/"), &ResolveOpts::default())
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, b"target");
        assert!(entries[1].is_directory());

        // without following, the link itself is returned
        let entries = fs
            .resolve_path(
                &path_names("/link"),
                &ResolveOpts {
                    no_follow_symlinks: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(entries[1].is_symlink());
    }

    #[test]
    fn test_parent_of_symlink_target() {
        let fs = memory_fs();

        let c_digest = fs.hash_of_empty_dir().to_string();
        let b_digest = fs
            .store_directory(&[dir_entry_for(b"c", &c_digest)], &Map::new())
            .unwrap();
        commit_root(
            &fs,
            &[
                symlink_entry(b"a", b"/b/c"),
                dir_entry_for(b"b", &b_digest),
            ],
        );

        // `..` acts on the resolved ancestor, not on the symlink
        let entries = fs
            .resolve_path(&path_names("/a/.."), &ResolveOpts::default())
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, b"b");
    }

    #[test]
    fn test_relative_symlink_target() {
        let fs = memory_fs();

        let sub_digest = fs
            .store_directory(&[symlink_entry(b"link", b"../x")], &Map::new())
            .unwrap();
        commit_root(
            &fs,
            &[
                dir_entry_for(b"sub", &sub_digest),
                file_entry(&fs, b"x", b"data"),
            ],
        );

        let entries = fs
            .resolve_path(&path_names("/sub/link/"), &ResolveOpts::default())
            .unwrap();
        assert_eq!(entries.last().unwrap().name, b"x");
        assert_eq!(entries.last().unwrap().kind, EntryKind::File);
    }

    #[test]
    fn test_symlink_chain_and_loop() {
        let fs = memory_fs();
        commit_root(
            &fs,
            &[
                symlink_entry(b"one", b"/two"),
                symlink_entry(b"two", b"/three"),
                file_entry(&fs, b"three", b"end"),
                symlink_entry(b"loop", b"/loop"),
                DirEntry::new(EntryKind::Symlink, b"dangling".to_vec()),
            ],
        );

        let entries = fs
            .resolve_path(&path_names("/one/"), &ResolveOpts::default())
            .unwrap();
        assert_eq!(entries.last().unwrap().name, b"three");

        assert!(matches!(
            fs.resolve_path(&path_names("/loop/"), &ResolveOpts::default()),
            Err(FsError::TooManySymlinks)
        ));
        assert!(matches!(
            fs.resolve_path(&path_names("/dangling/"), &ResolveOpts::default()),
            Err(FsError::InvalidSymlink(_))
        ));
    }

    #[test]
    fn test_unlink_to_empty_directory() {
        let fs = memory_fs();
        commit_root(&fs, &[file_entry(&fs, b"a", b"bytes")]);

        fs.unlink(&path_names("/a")).unwrap();

        // the deletion shadows the committed entry before commit
        assert!(matches!(
            fs.resolve_path(&path_names("/a"), &ResolveOpts::default()),
            Err(FsError::NoSuchEntry(_))
        ));

        let root = fs.commit().unwrap().unwrap();
        assert_eq!(root.digest_ref(), Some(fs.hash_of_empty_dir()));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let fs = CasFs::new(
            Arc::new(MemoryCasStore::new()),
            None,
            FsOptions {
                case_insensitive: true,
                ..Default::default()
            },
        )
        .unwrap();
        commit_root(&fs, &[file_entry(&fs, b"Foo", b"foo data")]);

        let entries = fs
            .resolve_path(&path_names("/foo"), &ResolveOpts::default())
            .unwrap();
        // lookup folds, the stored name does not
        assert_eq!(entries[1].name, b"Foo");

        // overriding through a folded key replaces the original entry
        fs.unlink(&path_names("/FOO")).unwrap();
        let root = fs.commit().unwrap().unwrap();
        assert_eq!(root.digest_ref(), Some(fs.hash_of_empty_dir()));
    }

    #[test]
    fn test_case_insensitive_duplicate_rejected() {
        let fs = CasFs::new(
            Arc::new(MemoryCasStore::new()),
            None,
            FsOptions {
                case_insensitive: true,
                ..Default::default()
            },
        )
        .unwrap();
        let entries = [
            file_entry(&fs, b"Name", b"1"),
            file_entry(&fs, b"name", b"2"),
        ];
        assert!(matches!(
            fs.store_directory(&entries, &Map::new()),
            Err(FsError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_overlay_visibility_and_rollback() {
        let fs = memory_fs();
        let entry = file_entry(&fs, b"", b"pending");

        fs.set_path(&path_names("/pending"), Some(entry), &ResolveOpts::default())
            .unwrap();
        assert!(fs.has_pending());

        let entries = fs
            .resolve_path(&path_names("/pending"), &ResolveOpts::default())
            .unwrap();
        assert_eq!(entries[1].name, b"pending");

        assert!(fs.rollback());
        assert!(!fs.has_pending());
        assert!(matches!(
            fs.resolve_path(&path_names("/pending"), &ResolveOpts::default()),
            Err(FsError::NoSuchEntry(_))
        ));

        // commit with an empty overlay is a no-op
        assert!(fs.commit().unwrap().is_none());
    }

    #[test]
    fn test_resolver_errors() {
        let fs = memory_fs();
        commit_root(&fs, &[file_entry(&fs, b"file", b"data")]);

        assert!(matches!(
            fs.resolve_path(&path_names("/.."), &ResolveOpts::default()),
            Err(FsError::EscapesRoot)
        ));
        assert!(matches!(
            fs.resolve_path(&path_names("/file/x"), &ResolveOpts::default()),
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            fs.resolve_path(&path_names("/missing"), &ResolveOpts::default()),
            Err(FsError::NoSuchEntry(_))
        ));
        // wrong volume name
        assert!(matches!(
            fs.resolve_path(&[b"vol".to_vec()], &ResolveOpts::default()),
            Err(FsError::NoSuchEntry(_))
        ));
    }

    #[test]
    fn test_unstored_directory() {
        let fs = memory_fs();
        // a directory entry without a reference (elided at scan time)
        commit_root(&fs, &[DirEntry::new(EntryKind::Directory, b"gone".to_vec())]);

        assert!(matches!(
            fs.resolve_path(&path_names("/gone/x"), &ResolveOpts::default()),
            Err(FsError::DirectoryNotInStorage(_))
        ));
    }

    #[test]
    fn test_partial_resolution() {
        let fs = memory_fs();

        let entries = fs
            .resolve_path(&path_names("/no/such/leaf"), &ResolveOpts::partial())
            .unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[2].kind, EntryKind::Directory);
        assert_eq!(entries[3].kind, EntryKind::File);
        assert_eq!(entries[3].name, b"leaf");

        // placeholders are not installed
        assert!(matches!(
            fs.resolve_path(&path_names("/no"), &ResolveOpts::default()),
            Err(FsError::NoSuchEntry(_))
        ));
    }

    #[test]
    fn test_mkdir_defaults() {
        let fs = memory_fs();
        let opts = ResolveOpts {
            partial: true,
            mkdir_defaults: Some(EntryPatch {
                stat: EntryStat {
                    mode: Some(0o750),
                    uid: Some(1000),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let entries = fs.resolve_path(&path_names("/fresh"), &opts).unwrap();
        assert_eq!(entries[1].stat.mode, Some(0o750));
        assert_eq!(entries[1].stat.uid, Some(1000));
    }

    #[test]
    fn test_mkdir_two_replaces_non_directories() {
        let fs = memory_fs();
        commit_root(&fs, &[file_entry(&fs, b"file", b"data")]);

        let opts = ResolveOpts {
            partial: true,
            mkdir: 2,
            ..Default::default()
        };
        let entries = fs.resolve_path(&path_names("/file/below"), &opts).unwrap();
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[1].name, b"file");
        assert_eq!(entries[2].name, b"below");
    }

    #[test]
    fn test_commit_nested_directories() {
        let fs = memory_fs();
        let entry = file_entry(&fs, b"", b"deep content");

        fs.set_path(
            &path_names("/d1/d2/f"),
            Some(entry),
            &ResolveOpts::mkdir(1),
        )
        .unwrap();
        let root = fs.commit().unwrap().unwrap();

        // the committed tree resolves without the overlay
        let entries = fs
            .resolve_path(&path_names("/d1/d2/f"), &ResolveOpts::default())
            .unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].kind, EntryKind::File);

        let root_dir = fs.get_dir(root.digest_ref().unwrap()).unwrap().unwrap();
        assert_eq!(root_dir.len(), 1);
        let d1 = &root_dir.entries()[0];
        assert_eq!(d1.name, b"d1");
        assert!(d1.digest_ref().is_some());
    }

    #[test]
    fn test_commit_keeps_unrelated_entries_and_metadata() {
        let fs = memory_fs();

        let mut metadata = Map::new();
        metadata.insert("origin".to_string(), serde_json::json!("host1"));
        let keep = file_entry(&fs, b"keep", b"keep data");
        let digest = fs.store_directory(&[keep.clone()], &metadata).unwrap();
        fs.set_root_entry(dir_entry_for(b"", &digest)).unwrap();

        let added = file_entry(&fs, b"", b"added data");
        fs.set_path(&path_names("/added"), Some(added), &ResolveOpts::default())
            .unwrap();
        let root = fs.commit().unwrap().unwrap();

        let dir = fs.get_dir(root.digest_ref().unwrap()).unwrap().unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.find_entry(b"keep", false).unwrap(), &keep);
        assert_eq!(dir.metadata(), &metadata);
    }

    #[test]
    fn test_update_path() {
        let fs = memory_fs();
        commit_root(&fs, &[file_entry(&fs, b"a", b"data")]);
        let old_ref = fs
            .resolve_path(&path_names("/a"), &ResolveOpts::default())
            .unwrap()[1]
            .reference
            .clone();

        let patch = EntryPatch {
            stat: EntryStat {
                mode: Some(0o600),
                ..Default::default()
            },
            ..Default::default()
        };
        fs.update_path(&path_names("/a"), &patch, &ResolveOpts::default())
            .unwrap();
        fs.commit().unwrap().unwrap();

        let entries = fs
            .resolve_path(&path_names("/a"), &ResolveOpts::default())
            .unwrap();
        assert_eq!(entries[1].stat.mode, Some(0o600));
        // untouched fields survive
        assert_eq!(entries[1].reference, old_ref);

        // updating a missing entry fails
        assert!(fs
            .update_path(&path_names("/missing"), &patch, &ResolveOpts::default())
            .is_err());
    }

    #[test]
    fn test_mkdir_and_touch() {
        let fs = memory_fs();

        fs.mkdir(&path_names("/dir/sub")).unwrap();
        fs.touch(&path_names("/dir/sub/file")).unwrap();
        let root = fs.commit().unwrap().unwrap();
        assert!(root.digest_ref().is_some());

        let entries = fs
            .resolve_path(&path_names("/dir/sub/file"), &ResolveOpts::default())
            .unwrap();
        let file = entries.last().unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.digest_ref(), Some(fs.store().hash_of_null()));
        assert_eq!(file.stat.size, Some(0));

        // mkdir over an existing directory is a no-op
        fs.mkdir(&path_names("/dir")).unwrap();
        // mkdir over a file is not
        assert!(matches!(
            fs.mkdir(&path_names("/dir/sub/file")),
            Err(FsError::NotADirectory(_))
        ));

        // touching the file again only bumps the timestamp
        fs.touch(&path_names("/dir/sub/file")).unwrap();
        let entries = fs
            .resolve_path(&path_names("/dir/sub/file"), &ResolveOpts::default())
            .unwrap();
        assert_eq!(
            entries.last().unwrap().digest_ref(),
            Some(fs.store().hash_of_null())
        );
    }

    #[test]
    fn test_unlink_missing_fails() {
        let fs = memory_fs();
        assert!(matches!(
            fs.unlink(&path_names("/nope")),
            Err(FsError::NoSuchEntry(_))
        ));
    }

    #[test]
    fn test_facade() {
        let fs = memory_fs();
        let sub_digest = fs
            .store_directory(&[file_entry(&fs, b"data.bin", b"payload")], &Map::new())
            .unwrap();
        commit_root(&fs, &[dir_entry_for(b"sub", &sub_digest)]);

        let path = fs.path("/sub");
        assert_eq!(path.kind().unwrap(), EntryKind::Directory);

        let file = path.subpath(&[b"data.bin".to_vec()]);
        assert_eq!(file.kind().unwrap(), EntryKind::File);
        let mut handle = file.open().unwrap();
        assert_eq!(handle.read_all().unwrap(), b"payload");
        assert!(path.open().is_err());
    }
}
