//! Deduplicating directory storage over a content addressable store.
//!
//! # Data format
//!
//! Every directory of a backed up tree is serialized into a blob and
//! stored under the SHA256 digest of its bytes. A directory entry for a
//! subdirectory carries that digest, so the digest of the root
//! directory transitively names the entire tree: a snapshot is a single
//! digest. Serialization is canonical (sorted entries, sorted json
//! keys), which means identical directories produce identical blobs and
//! unchanged subtrees are shared between snapshots for free.
//!
//! Two codecs are supported and dispatched via a format tag embedded in
//! the blob header: the default canonical json codec, which carries the
//! full stat metadata, and a compact codec storing only names, types
//! and references.
//!
//! # Virtual filesystem
//!
//! [CasFs] layers path resolution over the stored tree: symlinks, `..`
//! and optional case folding behave like a Unix kernel. Edits never
//! touch committed blobs; they accumulate in an in-memory overlay and
//! [CasFs::commit] folds them bottom-up into new blobs, producing a new
//! root digest in one step.

pub mod backup_root;
pub mod cas;
pub mod config;
pub mod dir_cache;
pub mod dir_codec;
pub mod dir_entry;
pub mod directory;
pub mod error;
pub mod file_formats;
pub mod resolve;
pub mod snapshot_log;
pub mod vpath;

mod filesystem;

pub use backup_root::{BackupRoot, BLOB_DIR_NAME};
pub use cas::{CasFile, CasStore, LocalCasStore, MemoryCasStore};
pub use config::{BackupConfig, CONFIG_NAME};
pub use dir_cache::DirCache;
pub use dir_entry::{DirEntry, EntryKind, EntryPatch, EntryStat};
pub use directory::Directory;
pub use error::FsError;
pub use filesystem::{CasFs, FsOptions};
pub use resolve::ResolveOpts;
pub use snapshot_log::{SnapshotLog, SnapshotRecord, SNAPSHOT_LOG_NAME};
pub use vpath::{path_names, VPath};
