use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// The type of a directory entry.
///
/// The discriminants double as the single byte type codes of the compact
/// directory codec.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File = b'f',
    Directory = b'd',
    Symlink = b'l',
    CharDevice = b'c',
    BlockDevice = b'b',
    Fifo = b'p',
    Socket = b's',
}

impl TryFrom<u8> for EntryKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            b'f' => EntryKind::File,
            b'd' => EntryKind::Directory,
            b'l' => EntryKind::Symlink,
            b'c' => EntryKind::CharDevice,
            b'b' => EntryKind::BlockDevice,
            b'p' => EntryKind::Fifo,
            b's' => EntryKind::Socket,
            _ => bail!("invalid entry type code '{}'", char::from(value)),
        })
    }
}

impl EntryKind {
    /// The textual type name used by the json codec.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink => "symlink",
            EntryKind::CharDevice => "chardev",
            EntryKind::BlockDevice => "blockdev",
            EntryKind::Fifo => "pipe",
            EntryKind::Socket => "socket",
        }
    }

    pub fn parse(name: &str) -> Result<Self, Error> {
        Ok(match name {
            "file" => EntryKind::File,
            "dir" => EntryKind::Directory,
            "symlink" => EntryKind::Symlink,
            "chardev" => EntryKind::CharDevice,
            "blockdev" => EntryKind::BlockDevice,
            "pipe" => EntryKind::Fifo,
            "socket" => EntryKind::Socket,
            _ => bail!("invalid entry type name '{}'", name),
        })
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", char::from(*self as u8))
    }
}

/// Optional stat metadata attached to a directory entry.
///
/// All fields are optional and absence is distinguishable from zero;
/// codecs are free to drop fields they cannot represent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modify_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nlink: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocksize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<u64>,
}

macro_rules! merge_stat_fields {
    ($target:expr, $other:expr, $($field:ident)+) => {
        $(
            if $other.$field.is_some() {
                $target.$field = $other.$field.clone();
            }
        )+
    };
}

impl EntryStat {
    /// Overlay all fields set in `other` onto `self`.
    pub fn merge(&mut self, other: &EntryStat) {
        merge_stat_fields!(
            self, other,
            size create_ts modify_ts uid gid user group mode
            atime ctime dev inode nlink blocksize blocks
        );
    }
}

/// Represents a named directory entry
///
/// The entry is an immutable value type; "modification" goes through
/// [DirEntry::with_patch] which produces a changed copy.
///
/// The meaning of `reference` depends on `kind`: for files and
/// directories it holds the content digest, for symlinks the link
/// target, for devices an opaque device identifier, and for fifos and
/// sockets it is unset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub kind: EntryKind,
    pub reference: Option<Vec<u8>>,
    pub stat: EntryStat,
}

/// Field overrides for [DirEntry::with_patch].
///
/// `reference` uses a double option: the outer level selects whether the
/// field is touched at all, the inner one is the new value.
#[derive(Clone, Debug, Default)]
pub struct EntryPatch {
    pub kind: Option<EntryKind>,
    pub reference: Option<Option<Vec<u8>>>,
    pub stat: EntryStat,
}

impl DirEntry {
    pub fn new(kind: EntryKind, name: Vec<u8>) -> Self {
        Self {
            name,
            kind,
            reference: None,
            stat: EntryStat::default(),
        }
    }

    /// Check if this entry is a directory
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Check if this entry is a symlink
    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// The content digest for file and directory entries.
    ///
    /// Returns `None` for other kinds, for entries without a stored
    /// reference and for references that are not valid UTF-8 (digests
    /// always are).
    pub fn digest_ref(&self) -> Option<&str> {
        match self.kind {
            EntryKind::File | EntryKind::Directory => self
                .reference
                .as_deref()
                .filter(|r| !r.is_empty())
                .and_then(|r| std::str::from_utf8(r).ok()),
            _ => None,
        }
    }

    /// The link target of a symlink entry.
    pub fn symlink_target(&self) -> Option<&[u8]> {
        match self.kind {
            EntryKind::Symlink => self.reference.as_deref().filter(|r| !r.is_empty()),
            _ => None,
        }
    }

    /// Return a copy with the given fields replaced.
    pub fn with_patch(&self, patch: &EntryPatch) -> Self {
        let mut entry = self.clone();
        if let Some(kind) = patch.kind {
            entry.kind = kind;
        }
        if let Some(reference) = &patch.reference {
            entry.reference = reference.clone();
        }
        entry.stat.merge(&patch.stat);
        entry
    }

    /// Return a copy with a replaced reference.
    pub fn with_reference(&self, reference: Option<Vec<u8>>) -> Self {
        let mut entry = self.clone();
        entry.reference = reference;
        entry
    }
}

/// Fold a lookup key according to the case policy.
///
/// Folding is ASCII only; names are opaque byte strings, so any locale
/// dependent unicode folding would tie lookups to ambient state.
pub(crate) fn fold_key(name: &[u8], case_insensitive: bool) -> Vec<u8> {
    if case_insensitive {
        name.to_ascii_lowercase()
    } else {
        name.to_vec()
    }
}

pub(crate) fn names_equal(a: &[u8], b: &[u8], case_insensitive: bool) -> bool {
    if case_insensitive {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

#[test]
fn test_entry_kind_codes() {
    for kind in [
        EntryKind::File,
        EntryKind::Directory,
        EntryKind::Symlink,
        EntryKind::CharDevice,
        EntryKind::BlockDevice,
        EntryKind::Fifo,
        EntryKind::Socket,
    ] {
        assert_eq!(EntryKind::try_from(kind as u8).unwrap(), kind);
        assert_eq!(EntryKind::parse(kind.as_str()).unwrap(), kind);
    }
    assert!(EntryKind::try_from(b'x').is_err());
    assert!(EntryKind::parse("hardlink").is_err());
}

#[test]
fn test_entry_patch() {
    let mut entry = DirEntry::new(EntryKind::File, b"data.bin".to_vec());
    entry.reference = Some(b"0123".to_vec());
    entry.stat.size = Some(17);
    entry.stat.uid = Some(1000);

    let patch = EntryPatch {
        kind: None,
        reference: Some(Some(b"4567".to_vec())),
        stat: EntryStat {
            size: Some(4),
            modify_ts: Some(1700000000),
            ..Default::default()
        },
    };

    let patched = entry.with_patch(&patch);
    assert_eq!(patched.name, b"data.bin");
    assert_eq!(patched.kind, EntryKind::File);
    assert_eq!(patched.reference.as_deref(), Some(&b"4567"[..]));
    assert_eq!(patched.stat.size, Some(4));
    assert_eq!(patched.stat.modify_ts, Some(1700000000));
    // untouched fields are inherited
    assert_eq!(patched.stat.uid, Some(1000));
    // the original is unchanged
    assert_eq!(entry.stat.size, Some(17));
}

#[test]
fn test_digest_ref_rules() {
    let mut entry = DirEntry::new(EntryKind::Symlink, b"link".to_vec());
    entry.reference = Some(b"../target".to_vec());
    assert_eq!(entry.digest_ref(), None);
    assert_eq!(entry.symlink_target(), Some(&b"../target"[..]));

    let mut entry = DirEntry::new(EntryKind::Directory, b"sub".to_vec());
    assert_eq!(entry.digest_ref(), None);
    entry.reference = Some(b"abcd".to_vec());
    assert_eq!(entry.digest_ref(), Some("abcd"));
}
