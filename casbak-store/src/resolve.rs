//! Path resolution over the committed tree and the overlay.
//!
//! Resolution walks a stack of path nodes, consuming one name component
//! at a time. Symlink targets are spliced into the remaining components
//! (always split on `/`, independent of the host OS), `..` pops the
//! resolved ancestor like a kernel would, and overlay overrides shadow
//! the committed directory at every level.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::format_err;

use crate::dir_entry::{fold_key, names_equal, DirEntry, EntryKind, EntryPatch};
use crate::directory::Directory;
use crate::error::FsError;
use crate::filesystem::{CasFs, OverlayChild, OverlayNode};

/// Maximum number of symlink expansions within one resolution.
const MAX_SYMLINK_DEPTH: usize = 40;

/// Flags steering path resolution.
#[derive(Clone, Default)]
pub struct ResolveOpts {
    /// Expand symlink entries while descending (default). Without this,
    /// a symlink mid-path is an error and a final symlink is returned
    /// as-is.
    pub no_follow_symlinks: bool,
    /// Fabricate placeholder entries for missing trailing components
    /// instead of failing.
    pub partial: bool,
    /// 1: fabricate missing directories; 2: additionally replace
    /// non-directory entries encountered mid-path.
    pub mkdir: u8,
    /// Field overrides applied to fabricated entries.
    pub mkdir_defaults: Option<EntryPatch>,
}

impl ResolveOpts {
    pub fn partial() -> Self {
        Self {
            partial: true,
            ..Default::default()
        }
    }

    pub fn mkdir(level: u8) -> Self {
        Self {
            mkdir: level,
            ..Default::default()
        }
    }
}

/// One level of a resolved path.
///
/// Carries the effective entry, the decoded underlying directory when
/// one was loaded on the way, and the overlay node governing this level
/// if there is one.
pub(crate) struct PathNode<'o> {
    pub entry: DirEntry,
    pub dir: Option<Arc<Directory>>,
    pub overlay: Option<&'o OverlayNode>,
}

fn fabricate_entry(name: Vec<u8>, kind: EntryKind, opts: &ResolveOpts) -> DirEntry {
    let entry = DirEntry::new(kind, name);
    match &opts.mkdir_defaults {
        Some(defaults) => {
            // the placeholder keeps its name and kind
            let mut patch = defaults.clone();
            patch.kind = None;
            entry.with_patch(&patch)
        }
        None => entry,
    }
}

pub(crate) fn resolve_nodes<'o>(
    fs: &CasFs,
    root_entry: &DirEntry,
    overlay_root: Option<&'o OverlayNode>,
    names: &[Vec<u8>],
    opts: &ResolveOpts,
) -> Result<Vec<PathNode<'o>>, FsError> {
    let case_insensitive = fs.case_insensitive();

    let volume = match names.first() {
        Some(volume) => volume,
        None => return Err(FsError::Other(format_err!("empty path"))),
    };
    if !names_equal(&root_entry.name, volume, case_insensitive) {
        return Err(FsError::NoSuchEntry(volume.clone().into()));
    }

    let root_node = match overlay_root {
        Some(node) => PathNode {
            entry: node.entry.clone(),
            dir: node.dir.clone(),
            overlay: Some(node),
        },
        None => PathNode {
            entry: root_entry.clone(),
            dir: None,
            overlay: None,
        },
    };

    let mut stack = vec![root_node];
    let mut parts: VecDeque<Vec<u8>> = names[1..].iter().cloned().collect();
    let mut symlink_depth = 0;

    while !parts.is_empty() {
        // a symlink on top of the stack is expanded in place before the
        // next component is looked at; this is what makes a trailing
        // empty component force resolution of the final entry
        if stack.last().unwrap().entry.is_symlink() && !opts.no_follow_symlinks {
            symlink_depth += 1;
            if symlink_depth > MAX_SYMLINK_DEPTH {
                return Err(FsError::TooManySymlinks);
            }

            let node = stack.pop().unwrap();
            let target = match node.entry.symlink_target() {
                Some(target) => target.to_vec(),
                None => return Err(FsError::InvalidSymlink(node.entry.name.into())),
            };

            // symlink targets use '/' regardless of the host OS
            let absolute = target[0] == b'/';
            if absolute {
                stack.truncate(1);
            }
            let segments: Vec<&[u8]> = target.split(|&b| b == b'/').collect();
            let skip = if absolute { 1 } else { 0 };
            for segment in segments[skip..].iter().rev() {
                parts.push_front(segment.to_vec());
            }
            continue;
        }

        if !stack.last().unwrap().entry.is_directory() {
            if opts.mkdir >= 2 {
                let name = stack.last().unwrap().entry.name.clone();
                let entry = fabricate_entry(name, EntryKind::Directory, opts);
                *stack.last_mut().unwrap() = PathNode {
                    entry,
                    dir: None,
                    overlay: None,
                };
            } else {
                return Err(FsError::NotADirectory(
                    stack.last().unwrap().entry.name.clone().into(),
                ));
            }
        }

        let name = parts.pop_front().unwrap();
        if name.is_empty() || name == b"." {
            continue;
        }
        if name == b".." {
            if stack.len() <= 1 {
                return Err(FsError::EscapesRoot);
            }
            stack.pop();
            continue;
        }

        let key = fold_key(&name, case_insensitive);

        // overlay overrides shadow the committed directory
        let mut found: Option<PathNode<'o>> = None;
        let mut shadowed = false;
        if let Some(overlay) = stack.last().unwrap().overlay {
            match overlay.subtree.get(&key) {
                Some(OverlayChild::Deleted) => shadowed = true,
                Some(OverlayChild::Node(child)) => {
                    found = Some(PathNode {
                        entry: child.entry.clone(),
                        dir: child.dir.clone(),
                        overlay: Some(child),
                    });
                }
                None => (),
            }
        }

        let mut parent_unstored = false;
        if found.is_none() && !shadowed {
            let top = stack.last_mut().unwrap();
            if top.dir.is_none() {
                match top.entry.digest_ref() {
                    Some(digest) => {
                        let digest = digest.to_string();
                        match fs.get_dir(&digest)? {
                            Some(dir) => top.dir = Some(dir),
                            None => {
                                return Err(FsError::DirectoryNotInStorage(
                                    top.entry.name.clone().into(),
                                ))
                            }
                        }
                    }
                    None => parent_unstored = true,
                }
            }
            if let Some(dir) = &top.dir {
                if let Some(entry) = dir.find_entry(&name, case_insensitive) {
                    found = Some(PathNode {
                        entry: entry.clone(),
                        dir: None,
                        overlay: None,
                    });
                }
            }
        }

        let next = match found {
            Some(node) => node,
            None => {
                if opts.partial || opts.mkdir >= 1 {
                    let kind = if parts.is_empty() {
                        EntryKind::File
                    } else {
                        EntryKind::Directory
                    };
                    PathNode {
                        entry: fabricate_entry(name, kind, opts),
                        dir: None,
                        overlay: None,
                    }
                } else if parent_unstored {
                    return Err(FsError::DirectoryNotInStorage(
                        stack.last().unwrap().entry.name.clone().into(),
                    ));
                } else {
                    return Err(FsError::NoSuchEntry(name.into()));
                }
            }
        };
        stack.push(next);
    }

    Ok(stack)
}
