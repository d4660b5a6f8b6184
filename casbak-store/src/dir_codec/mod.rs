//! Directory blob codecs.
//!
//! A directory blob is the common header from
//! [crate::file_formats] followed by a codec specific payload. Codecs
//! register under their format tag at program start; decoding looks the
//! tag up in that fixed table. A tag is never interpreted as anything
//! but a table key (in particular not as code to load).

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde_json::{Map, Value};

use crate::dir_entry::DirEntry;
use crate::directory::Directory;
use crate::error::FsError;
use crate::file_formats::{encode_dir_header, parse_dir_header};

pub mod json;
pub mod minimal;

pub trait DirectoryCodec: Send + Sync {
    /// The format tag this codec registers under.
    fn format_name(&self) -> &'static str;

    /// Encode the payload (header excluded) for a sorted entry list.
    fn encode_payload(
        &self,
        entries: &[DirEntry],
        metadata: &Map<String, Value>,
    ) -> Result<Vec<u8>, FsError>;

    /// Decode a payload into a [Directory] carrying `digest`.
    fn decode_payload(&self, payload: &[u8], digest: &str) -> Result<Directory, FsError>;
}

lazy_static! {
    static ref CODEC_REGISTRY: HashMap<&'static str, &'static dyn DirectoryCodec> = {
        let mut registry: HashMap<&'static str, &'static dyn DirectoryCodec> = HashMap::new();
        for codec in [
            &json::JsonCodec as &'static dyn DirectoryCodec,
            &minimal::MinimalCodec,
        ] {
            registry.insert(codec.format_name(), codec);
        }
        registry
    };
}

/// Look up a codec by format tag.
pub fn lookup_codec(format: &str) -> Option<&'static dyn DirectoryCodec> {
    CODEC_REGISTRY.get(format).copied()
}

/// Serialize a directory into a blob.
///
/// The entry list is canonicalized (sorted bytewise by name) before
/// encoding, so structurally equal directories always produce identical
/// bytes and therefore identical digests. Entries with colliding or
/// unrepresentable names are rejected.
pub fn serialize_dir(
    format: &str,
    entries: &[DirEntry],
    metadata: &Map<String, Value>,
) -> Result<Vec<u8>, FsError> {
    let codec = lookup_codec(format)
        .ok_or_else(|| FsError::UnsupportedFormat(format!("unknown format tag {:?}", format)))?;

    let mut sorted: Vec<DirEntry> = entries.to_vec();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in &sorted {
        if entry.name.contains(&b'/') || entry.name.contains(&0) {
            return Err(FsError::UnsupportedFormat(format!(
                "entry name {:?} contains '/' or NUL",
                String::from_utf8_lossy(&entry.name)
            )));
        }
    }
    for pair in sorted.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(FsError::DuplicateName(pair[0].name.clone().into()));
        }
    }

    let mut blob = encode_dir_header(format)?;
    blob.extend(codec.encode_payload(&sorted, metadata)?);
    Ok(blob)
}

/// Deserialize a directory blob fetched under `digest`.
pub fn deserialize_dir(blob: &[u8], digest: &str) -> Result<Directory, FsError> {
    let header = parse_dir_header(blob)?;
    let codec = lookup_codec(&header.format).ok_or_else(|| {
        FsError::BadDirectoryBlob(format!("unknown format tag {:?}", header.format))
    })?;
    codec.decode_payload(&blob[header.payload_start..], digest)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dir_entry::EntryKind;
    use crate::file_formats::{DEFAULT_FORMAT, MINIMAL_FORMAT};

    fn file_entry(name: &[u8], digest: &str) -> DirEntry {
        let mut entry = DirEntry::new(EntryKind::File, name.to_vec());
        entry.reference = Some(digest.as_bytes().to_vec());
        entry
    }

    #[test]
    fn test_serialize_is_canonical() {
        for format in [DEFAULT_FORMAT, MINIMAL_FORMAT] {
            let a = file_entry(b"a", "d1");
            let b = file_entry(b"b", "d2");

            let blob1 = serialize_dir(format, &[a.clone(), b.clone()], &Map::new()).unwrap();
            let blob2 = serialize_dir(format, &[b, a], &Map::new()).unwrap();
            assert_eq!(blob1, blob2);
        }
    }

    #[test]
    fn test_serialize_rejects_bad_names() {
        let dup = [file_entry(b"same", "d1"), file_entry(b"same", "d2")];
        assert!(matches!(
            serialize_dir(DEFAULT_FORMAT, &dup, &Map::new()),
            Err(FsError::DuplicateName(_))
        ));

        for bad in [&b"a/b"[..], b"a\0b"] {
            let entries = [file_entry(bad, "d1")];
            assert!(matches!(
                serialize_dir(DEFAULT_FORMAT, &entries, &Map::new()),
                Err(FsError::UnsupportedFormat(_))
            ));
        }
    }

    #[test]
    fn test_deserialize_unknown_tag() {
        let blob = b"CAS_Dir 07 no-such\n";
        assert!(matches!(
            deserialize_dir(blob, "digest"),
            Err(FsError::BadDirectoryBlob(_))
        ));
    }

    #[test]
    fn test_roundtrip_both_codecs() {
        let mut symlink = DirEntry::new(EntryKind::Symlink, b"link".to_vec());
        symlink.reference = Some(b"/target/path".to_vec());
        let entries = vec![
            file_entry(b"file", "d1"),
            symlink,
            DirEntry::new(EntryKind::Fifo, b"queue".to_vec()),
        ];

        for format in [DEFAULT_FORMAT, MINIMAL_FORMAT] {
            let blob = serialize_dir(format, &entries, &Map::new()).unwrap();
            let dir = deserialize_dir(&blob, "digest").unwrap();
            assert_eq!(dir.format(), format);
            assert_eq!(dir.digest(), "digest");
            assert_eq!(dir.len(), 3);
            let mut sorted = entries.clone();
            sorted.sort_by(|a, b| a.name.cmp(&b.name));
            assert_eq!(dir.entries(), &sorted[..]);
        }
    }
}
