use serde_json::{Map, Value};

use crate::dir_entry::{names_equal, DirEntry};

/// A decoded directory object.
///
/// Directories are immutable once decoded; edits go through the
/// filesystem overlay and produce a new blob (and therefore a new
/// digest) on commit. The digest recorded here is always the digest the
/// blob was fetched under.
pub struct Directory {
    digest: String,
    format: String,
    metadata: Map<String, Value>,
    entries: Vec<DirEntry>,
}

impl Directory {
    pub(crate) fn new(
        digest: String,
        format: String,
        metadata: Map<String, Value>,
        mut entries: Vec<DirEntry>,
    ) -> Self {
        // lookup relies on bytewise order
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            digest,
            format,
            metadata,
            entries,
        }
    }

    /// The digest of the serialized form of this directory.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The format tag of the codec this directory was decoded with.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Directory wide metadata (empty for codecs without metadata support).
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// All child entries, sorted bytewise by name.
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a child by name.
    ///
    /// The lookup key is case folded when `case_insensitive` is set; the
    /// returned entry always carries the name in its stored case.
    pub fn find_entry(&self, name: &[u8], case_insensitive: bool) -> Option<&DirEntry> {
        if case_insensitive {
            self.entries
                .iter()
                .find(|entry| names_equal(&entry.name, name, true))
        } else {
            self.entries
                .binary_search_by(|entry| entry.name.as_slice().cmp(name))
                .ok()
                .map(|idx| &self.entries[idx])
        }
    }
}
