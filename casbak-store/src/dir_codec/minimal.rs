//! The compact directory codec.
//!
//! The payload is a plain concatenation of entries:
//!
//! (NAMELEN || VALLEN || TYPE || Name || NUL || Value || NUL)
//!
//! with single byte lengths, the type codes of
//! [EntryKind](crate::dir_entry::EntryKind) and entries sorted bytewise
//! by name. The codec stores no optional metadata; names or values
//! longer than 255 bytes cannot be represented.

use serde_json::{Map, Value};

use crate::dir_entry::{DirEntry, EntryKind};
use crate::directory::Directory;
use crate::error::FsError;
use crate::file_formats::MINIMAL_FORMAT;

use super::DirectoryCodec;

pub struct MinimalCodec;

const MAX_FIELD_LEN: usize = 0xff;

fn entry_value(entry: &DirEntry) -> &[u8] {
    match entry.kind {
        // fifos and sockets never carry a value
        EntryKind::Fifo | EntryKind::Socket => b"",
        _ => entry.reference.as_deref().unwrap_or(b""),
    }
}

impl DirectoryCodec for MinimalCodec {
    fn format_name(&self) -> &'static str {
        MINIMAL_FORMAT
    }

    fn encode_payload(
        &self,
        entries: &[DirEntry],
        _metadata: &Map<String, Value>,
    ) -> Result<Vec<u8>, FsError> {
        let mut payload = Vec::new();

        for entry in entries {
            if entry.name.len() > MAX_FIELD_LEN {
                return Err(FsError::UnsupportedFormat(format!(
                    "entry name too long ({} > {})",
                    entry.name.len(),
                    MAX_FIELD_LEN
                )));
            }
            let value = entry_value(entry);
            if value.len() > MAX_FIELD_LEN {
                return Err(FsError::UnsupportedFormat(format!(
                    "entry value too long ({} > {})",
                    value.len(),
                    MAX_FIELD_LEN
                )));
            }
            if value.contains(&0) {
                return Err(FsError::UnsupportedFormat(
                    "entry value contains NUL".to_string(),
                ));
            }

            payload.push(entry.name.len() as u8);
            payload.push(value.len() as u8);
            payload.push(entry.kind as u8);
            payload.extend_from_slice(&entry.name);
            payload.push(0);
            payload.extend_from_slice(value);
            payload.push(0);
        }

        Ok(payload)
    }

    fn decode_payload(&self, payload: &[u8], digest: &str) -> Result<Directory, FsError> {
        let mut entries = Vec::new();
        let mut rest = payload;

        while !rest.is_empty() {
            if rest.len() < 3 {
                return Err(FsError::BadDirectoryBlob(
                    "truncated entry header".to_string(),
                ));
            }
            let name_len = rest[0] as usize;
            let value_len = rest[1] as usize;
            let kind = EntryKind::try_from(rest[2])
                .map_err(|err| FsError::BadDirectoryBlob(format!("{}", err)))?;

            let entry_len = 3 + name_len + 1 + value_len + 1;
            if rest.len() < entry_len {
                return Err(FsError::BadDirectoryBlob("truncated entry".to_string()));
            }

            let name = &rest[3..3 + name_len];
            let value = &rest[3 + name_len + 1..3 + name_len + 1 + value_len];
            if rest[3 + name_len] != 0 || rest[entry_len - 1] != 0 {
                return Err(FsError::BadDirectoryBlob(
                    "missing NUL terminator".to_string(),
                ));
            }

            let mut entry = DirEntry::new(kind, name.to_vec());
            if !value.is_empty() {
                match kind {
                    EntryKind::Fifo | EntryKind::Socket => {
                        return Err(FsError::BadDirectoryBlob(format!(
                            "unexpected value on '{}' entry",
                            kind
                        )));
                    }
                    _ => entry.reference = Some(value.to_vec()),
                }
            }
            entries.push(entry);

            rest = &rest[entry_len..];
        }

        Ok(Directory::new(
            digest.to_string(),
            MINIMAL_FORMAT.to_string(),
            Map::new(),
            entries,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(entries: &[DirEntry]) -> Directory {
        let payload = MinimalCodec.encode_payload(entries, &Map::new()).unwrap();
        MinimalCodec.decode_payload(&payload, "digest").unwrap()
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let mut entries = Vec::new();

        let mut entry = DirEntry::new(EntryKind::File, b"a-file".to_vec());
        entry.reference = Some(b"digest-1".to_vec());
        entries.push(entry);

        let mut entry = DirEntry::new(EntryKind::Directory, b"b-dir".to_vec());
        entry.reference = Some(b"digest-2".to_vec());
        entries.push(entry);

        let mut entry = DirEntry::new(EntryKind::Symlink, b"c-link".to_vec());
        entry.reference = Some(b"../somewhere".to_vec());
        entries.push(entry);

        let mut entry = DirEntry::new(EntryKind::CharDevice, b"d-tty".to_vec());
        entry.reference = Some(b"5:0".to_vec());
        entries.push(entry);

        let mut entry = DirEntry::new(EntryKind::BlockDevice, b"e-disk".to_vec());
        entry.reference = Some(b"8:16".to_vec());
        entries.push(entry);

        entries.push(DirEntry::new(EntryKind::Fifo, b"f-pipe".to_vec()));
        entries.push(DirEntry::new(EntryKind::Socket, b"g-sock".to_vec()));

        let dir = roundtrip(&entries);
        assert_eq!(dir.entries(), &entries[..]);
    }

    #[test]
    fn test_drops_stat_metadata() {
        let mut entry = DirEntry::new(EntryKind::File, b"file".to_vec());
        entry.reference = Some(b"digest".to_vec());
        entry.stat.size = Some(42);
        entry.stat.uid = Some(1000);

        let dir = roundtrip(&[entry]);
        let decoded = &dir.entries()[0];
        assert_eq!(decoded.reference.as_deref(), Some(&b"digest"[..]));
        assert_eq!(decoded.stat.size, None);
        assert_eq!(decoded.stat.uid, None);
    }

    #[test]
    fn test_field_length_limits() {
        // 255 bytes fits, 256 does not
        let long_name = vec![b'n'; 255];
        let entry = DirEntry::new(EntryKind::Fifo, long_name.clone());
        let dir = roundtrip(&[entry]);
        assert_eq!(dir.entries()[0].name, long_name);

        let entry = DirEntry::new(EntryKind::Fifo, vec![b'n'; 256]);
        assert!(matches!(
            MinimalCodec.encode_payload(&[entry], &Map::new()),
            Err(FsError::UnsupportedFormat(_))
        ));

        let mut entry = DirEntry::new(EntryKind::Symlink, b"link".to_vec());
        entry.reference = Some(vec![b'v'; 255]);
        let dir = roundtrip(&[entry]);
        assert_eq!(dir.entries()[0].reference.as_ref().unwrap().len(), 255);

        let mut entry = DirEntry::new(EntryKind::Symlink, b"link".to_vec());
        entry.reference = Some(vec![b'v'; 256]);
        assert!(matches!(
            MinimalCodec.encode_payload(&[entry], &Map::new()),
            Err(FsError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_unicode_names() {
        let entry = DirEntry::new(EntryKind::File, "müll-箱".as_bytes().to_vec());
        let dir = roundtrip(&[entry.clone()]);
        assert_eq!(dir.entries(), &[entry][..]);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // truncated header
        assert!(MinimalCodec.decode_payload(b"\x01", "digest").is_err());
        // truncated entry body
        assert!(MinimalCodec.decode_payload(b"\x05\x00fab", "digest").is_err());
        // unknown type code
        assert!(MinimalCodec
            .decode_payload(b"\x01\x00xn\x00\x00", "digest")
            .is_err());
        // missing NUL terminators
        assert!(MinimalCodec
            .decode_payload(b"\x01\x01fnXvX", "digest")
            .is_err());
        // value on a fifo entry
        assert!(MinimalCodec
            .decode_payload(b"\x01\x01pn\x00v\x00", "digest")
            .is_err());
    }
}
