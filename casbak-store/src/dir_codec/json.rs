//! The default directory codec (empty format tag).
//!
//! The payload is a single json object
//! `{"entries": [...], "metadata": {...}}` serialized canonically
//! (sorted object keys, UTF-8, no nulls), which makes the blob bytes a
//! pure function of the directory contents.

use anyhow::format_err;
use serde_json::{json, Map, Value};

use crate::dir_entry::{DirEntry, EntryKind, EntryStat};
use crate::directory::Directory;
use crate::error::FsError;
use crate::file_formats::DEFAULT_FORMAT;

use super::DirectoryCodec;

pub struct JsonCodec;

/// Encode an opaque byte string as a json value.
///
/// Names and references are byte strings; valid UTF-8 is stored as a
/// plain string, everything else falls back to `{"bytes": <base64>}` so
/// that round-trips are lossless.
fn bytes_to_json(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => json!({ "bytes": base64::encode(bytes) }),
    }
}

fn bytes_from_json(value: &Value) -> Result<Vec<u8>, FsError> {
    match value {
        Value::String(text) => Ok(text.as_bytes().to_vec()),
        Value::Object(map) => match map.get("bytes").and_then(Value::as_str) {
            Some(encoded) => base64::decode(encoded).map_err(|err| {
                FsError::BadDirectoryBlob(format!("invalid base64 byte string - {}", err))
            }),
            None => Err(FsError::BadDirectoryBlob(
                "byte string object without 'bytes' property".to_string(),
            )),
        },
        _ => Err(FsError::BadDirectoryBlob(
            "expected string or byte string object".to_string(),
        )),
    }
}

pub(crate) fn entry_to_json(entry: &DirEntry) -> Result<Value, FsError> {
    let stat = serde_json::to_value(&entry.stat)
        .map_err(|err| FsError::Other(format_err!("unable to serialize entry stat - {}", err)))?;
    let mut object = match stat {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    object.insert("name".to_string(), bytes_to_json(&entry.name));
    object.insert("type".to_string(), Value::String(entry.kind.as_str().to_string()));
    if let Some(reference) = &entry.reference {
        object.insert("ref".to_string(), bytes_to_json(reference));
    }
    Ok(Value::Object(object))
}

pub(crate) fn entry_from_json(value: &Value) -> Result<DirEntry, FsError> {
    let object = value
        .as_object()
        .ok_or_else(|| FsError::BadDirectoryBlob("entry is not an object".to_string()))?;

    let name = match object.get("name") {
        Some(name) => bytes_from_json(name)?,
        None => {
            return Err(FsError::BadDirectoryBlob(
                "entry without 'name' property".to_string(),
            ))
        }
    };
    let kind = match object.get("type").and_then(Value::as_str) {
        Some(kind) => EntryKind::parse(kind)
            .map_err(|err| FsError::BadDirectoryBlob(format!("{}", err)))?,
        None => {
            return Err(FsError::BadDirectoryBlob(
                "entry without 'type' property".to_string(),
            ))
        }
    };
    let reference = match object.get("ref") {
        Some(reference) => Some(bytes_from_json(reference)?),
        None => None,
    };
    let stat: EntryStat = serde_json::from_value(Value::Object(object.clone()))
        .map_err(|err| FsError::BadDirectoryBlob(format!("invalid entry stat - {}", err)))?;

    Ok(DirEntry {
        name,
        kind,
        reference,
        stat,
    })
}

impl DirectoryCodec for JsonCodec {
    fn format_name(&self) -> &'static str {
        DEFAULT_FORMAT
    }

    fn encode_payload(
        &self,
        entries: &[DirEntry],
        metadata: &Map<String, Value>,
    ) -> Result<Vec<u8>, FsError> {
        let entries = entries
            .iter()
            .map(entry_to_json)
            .collect::<Result<Vec<Value>, FsError>>()?;
        let payload = json!({
            "entries": entries,
            "metadata": Value::Object(metadata.clone()),
        });
        Ok(casbak_tools::json::to_canonical_json(&payload)?)
    }

    fn decode_payload(&self, payload: &[u8], digest: &str) -> Result<Directory, FsError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| FsError::BadDirectoryBlob(format!("invalid json payload - {}", err)))?;
        let object = value
            .as_object()
            .ok_or_else(|| FsError::BadDirectoryBlob("payload is not an object".to_string()))?;

        let metadata = match object.get("metadata") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(FsError::BadDirectoryBlob(
                    "'metadata' is not an object".to_string(),
                ))
            }
            None => Map::new(),
        };
        let entries = match object.get("entries") {
            Some(Value::Array(list)) => list
                .iter()
                .map(entry_from_json)
                .collect::<Result<Vec<DirEntry>, FsError>>()?,
            _ => {
                return Err(FsError::BadDirectoryBlob(
                    "missing 'entries' array".to_string(),
                ))
            }
        };

        Ok(Directory::new(
            digest.to_string(),
            DEFAULT_FORMAT.to_string(),
            metadata,
            entries,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(entries: &[DirEntry], metadata: &Map<String, Value>) -> Directory {
        let payload = JsonCodec.encode_payload(entries, metadata).unwrap();
        JsonCodec.decode_payload(&payload, "digest").unwrap()
    }

    #[test]
    fn test_roundtrip_with_stat() {
        let mut entry = DirEntry::new(EntryKind::File, b"report.txt".to_vec());
        entry.reference = Some(b"0011aabb".to_vec());
        entry.stat.size = Some(1234);
        entry.stat.modify_ts = Some(1700000000);
        entry.stat.mode = Some(0o644);
        entry.stat.uid = Some(0);

        let dir = roundtrip(&[entry.clone()], &Map::new());
        assert_eq!(dir.entries(), &[entry][..]);
    }

    #[test]
    fn test_absent_is_not_zero() {
        let entry = DirEntry::new(EntryKind::Fifo, b"queue".to_vec());
        let dir = roundtrip(&[entry], &Map::new());
        let decoded = &dir.entries()[0];
        assert_eq!(decoded.stat.size, None);
        assert_eq!(decoded.stat.uid, None);
        assert_eq!(decoded.reference, None);
    }

    #[test]
    fn test_non_utf8_names() {
        let mut entry = DirEntry::new(EntryKind::Symlink, b"latin1-\xe4\xf6".to_vec());
        entry.reference = Some(b"target-\xff".to_vec());

        let payload = JsonCodec.encode_payload(&[entry.clone()], &Map::new()).unwrap();
        // payload must still be valid UTF-8
        std::str::from_utf8(&payload).unwrap();

        let dir = JsonCodec.decode_payload(&payload, "digest").unwrap();
        assert_eq!(dir.entries(), &[entry][..]);
    }

    #[test]
    fn test_unicode_names() {
        let entry = DirEntry::new(EntryKind::File, "Grüße-日本".as_bytes().to_vec());
        let dir = roundtrip(&[entry.clone()], &Map::new());
        assert_eq!(dir.entries(), &[entry][..]);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut metadata = Map::new();
        metadata.insert("origin".to_string(), Value::String("host1".to_string()));

        let dir = roundtrip(&[], &metadata);
        assert!(dir.is_empty());
        assert_eq!(dir.metadata(), &metadata);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(JsonCodec.decode_payload(b"{", "digest").is_err());
        assert!(JsonCodec.decode_payload(b"[]", "digest").is_err());
        assert!(JsonCodec.decode_payload(b"{\"metadata\":{}}", "digest").is_err());
        // entry with inconsistent type
        let payload = br#"{"entries":[{"name":"x","type":"hardlink"}],"metadata":{}}"#;
        assert!(JsonCodec.decode_payload(payload, "digest").is_err());
    }
}
