use crate::error::FsError;

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

/// Magic bytes opening every directory blob (trailing space included).
pub const DIR_BLOB_MAGIC: &[u8; 8] = b"CAS_Dir ";

/// Format tag of the default (canonical json) directory codec.
pub const DEFAULT_FORMAT: &str = "";

/// Format tag of the compact directory codec.
///
/// Kept for compatibility with existing stores; the tag is an opaque
/// identifier and is never interpreted beyond registry lookup.
pub const MINIMAL_FORMAT: &str = "File::CAS::Dir::Minimal";

/// Directory blob binary storage format
///
/// Every directory blob starts with the 8 byte magic, two uppercase hex
/// digits giving the byte length of the format tag, a single space, the
/// format tag itself and a terminating newline:
///
/// (MAGIC || HEXLEN || ' ' || TAG || '\n' || Payload)
///
/// The payload layout is owned by the codec registered under TAG.
pub struct DirBlobHeader {
    pub format: String,
    pub payload_start: usize,
}

/// Header size for a given format tag.
pub fn header_size(format: &str) -> usize {
    12 + format.len()
}

/// Encode the common directory blob header for `format`.
pub fn encode_dir_header(format: &str) -> Result<Vec<u8>, FsError> {
    if format.len() > 0xff {
        return Err(FsError::UnsupportedFormat(format!(
            "format tag too long ({} > 255)",
            format.len()
        )));
    }
    let mut header = Vec::with_capacity(header_size(format));
    header.extend_from_slice(DIR_BLOB_MAGIC);
    header.extend_from_slice(format!("{:02X} ", format.len()).as_bytes());
    header.extend_from_slice(format.as_bytes());
    header.push(b'\n');
    Ok(header)
}

/// Parse the common directory blob header.
pub fn parse_dir_header(blob: &[u8]) -> Result<DirBlobHeader, FsError> {
    if blob.len() < 12 {
        return Err(FsError::BadDirectoryBlob(format!(
            "truncated header ({} bytes)",
            blob.len()
        )));
    }
    if &blob[0..8] != DIR_BLOB_MAGIC {
        return Err(FsError::BadDirectoryBlob(
            "wrong magic number".to_string(),
        ));
    }

    let len_digits = std::str::from_utf8(&blob[8..10])
        .map_err(|_| FsError::BadDirectoryBlob("bad format tag length".to_string()))?;
    let tag_len = usize::from_str_radix(len_digits, 16)
        .map_err(|_| FsError::BadDirectoryBlob("bad format tag length".to_string()))?;

    if blob[10] != b' ' {
        return Err(FsError::BadDirectoryBlob(
            "malformed header (missing separator)".to_string(),
        ));
    }
    if blob.len() < 12 + tag_len {
        return Err(FsError::BadDirectoryBlob(
            "truncated format tag".to_string(),
        ));
    }
    if blob[11 + tag_len] != b'\n' {
        return Err(FsError::BadDirectoryBlob(
            "malformed header (missing terminator)".to_string(),
        ));
    }

    let format = std::str::from_utf8(&blob[11..11 + tag_len])
        .map_err(|_| FsError::BadDirectoryBlob("format tag is not valid UTF-8".to_string()))?
        .to_string();

    Ok(DirBlobHeader {
        format,
        payload_start: 12 + tag_len,
    })
}

#[test]
fn test_dir_header_roundtrip() {
    for format in [DEFAULT_FORMAT, MINIMAL_FORMAT, "x"] {
        let header = encode_dir_header(format).unwrap();
        assert_eq!(header.len(), header_size(format));

        let parsed = parse_dir_header(&header).unwrap();
        assert_eq!(parsed.format, format);
        assert_eq!(parsed.payload_start, header.len());
    }
}

#[test]
fn test_dir_header_empty_tag_bytes() {
    // the fixed part of the header is exactly 12 bytes for the default codec
    let header = encode_dir_header(DEFAULT_FORMAT).unwrap();
    assert_eq!(&header[..], b"CAS_Dir 00 \n");
}

#[test]
fn test_dir_header_rejects_garbage() {
    assert!(parse_dir_header(b"").is_err());
    assert!(parse_dir_header(b"CAS_Dir").is_err());
    assert!(parse_dir_header(b"NOT_Dir 00 \n").is_err());
    assert!(parse_dir_header(b"CAS_Dir ZZ \n").is_err());
    assert!(parse_dir_header(b"CAS_Dir 05 ab\n").is_err()); // tag shorter than announced
    assert!(parse_dir_header(b"CAS_Dir 02 abX").is_err()); // missing terminator
}
