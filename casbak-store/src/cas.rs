//! Content addressable blob storage.
//!
//! Blobs are opaque byte strings addressed by the lowercase hex SHA-256
//! digest of their content. The filesystem layer only depends on the
//! [CasStore] trait; [LocalCasStore] keeps blobs in a fan-out directory
//! tree on disk, [MemoryCasStore] keeps them in a hash map.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::format_err;

use proxmox_sys::fs::create_path;

use crate::error::FsError;

/// Compute the blob digest for a byte string.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}

fn streaming_digest<W: Write>(
    reader: &mut dyn Read,
    mut sink: Option<&mut W>,
) -> Result<(String, u64), std::io::Error> {
    let mut hasher = openssl::sha::Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let got = reader.read(&mut buffer)?;
        if got == 0 {
            break;
        }
        hasher.update(&buffer[..got]);
        if let Some(sink) = sink.as_mut() {
            sink.write_all(&buffer[..got])?;
        }
        total += got as u64;
    }
    Ok((hex::encode(hasher.finish()), total))
}

fn check_digest(digest: &str) -> Result<(), FsError> {
    let valid = digest.len() == 64
        && digest
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !valid {
        return Err(FsError::Other(format_err!(
            "malformed digest '{}'",
            digest
        )));
    }
    Ok(())
}

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Read handle for a stored blob.
pub struct CasFile {
    digest: String,
    size: u64,
    reader: Box<dyn ReadSeek>,
}

impl CasFile {
    /// The digest this blob is stored under.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Blob length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the whole blob into memory.
    pub fn read_all(&mut self) -> Result<Vec<u8>, std::io::Error> {
        self.reader.seek(SeekFrom::Start(0))?;
        let mut data = Vec::with_capacity(self.size as usize);
        self.reader.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl Read for CasFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        self.reader.read(buf)
    }
}

impl Seek for CasFile {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, std::io::Error> {
        self.reader.seek(pos)
    }
}

/// Storage contract required by the filesystem layer.
pub trait CasStore: Send + Sync {
    /// Open a blob for reading, `None` if it is not stored.
    fn get(&self, digest: &str) -> Result<Option<CasFile>, FsError>;

    /// Store a blob, returning its digest.
    fn put_scalar(&self, data: &[u8]) -> Result<String, FsError>;

    /// Store the content of a reader, returning its digest.
    fn put_handle(&self, reader: &mut dyn Read) -> Result<String, FsError>;

    /// Store the content of a regular file, returning its digest.
    fn put_file(&self, path: &Path) -> Result<String, FsError> {
        let mut file = std::fs::File::open(path)?;
        self.put_handle(&mut file)
    }

    /// Re-hash a stored blob and compare against its digest.
    fn validate(&self, digest: &str) -> Result<bool, FsError>;

    /// The digest of the zero length blob (stored at open time).
    fn hash_of_null(&self) -> &str;
}

/// File system based blob store
///
/// Blobs live under `<base>/<4 hex digits>/<64 hex digits>`; the prefix
/// level keeps directories small on large stores. Writes go to a
/// temporary file first and are moved in place with an atomic rename,
/// so concurrent writers storing the same content are harmless.
pub struct LocalCasStore {
    base: PathBuf,
    null_digest: String,
    mutex: Mutex<()>,
    tmp_counter: AtomicU64,
}

impl LocalCasStore {
    /// Create a new blob store directory and open it.
    pub fn create<P: Into<PathBuf>>(base: P) -> Result<Self, FsError> {
        let base: PathBuf = base.into();
        create_path(&base, None, None)
            .map_err(|err| FsError::Other(format_err!("unable to create blob store at {:?} - {}", base, err)))?;
        Self::open(base)
    }

    /// Open an existing blob store directory.
    pub fn open<P: Into<PathBuf>>(base: P) -> Result<Self, FsError> {
        let base: PathBuf = base.into();
        let metadata = std::fs::metadata(&base).map_err(|err| {
            FsError::Other(format_err!("unable to open blob store at {:?} - {}", base, err))
        })?;
        if !metadata.is_dir() {
            return Err(FsError::Other(format_err!(
                "blob store path {:?} is not a directory",
                base
            )));
        }

        let mut store = Self {
            base,
            null_digest: String::new(),
            mutex: Mutex::new(()),
            tmp_counter: AtomicU64::new(0),
        };
        store.null_digest = store.put_scalar(&[])?;
        Ok(store)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let mut path = self.base.clone();
        path.push(&digest[0..4]);
        path.push(digest);
        path
    }

    fn tmp_path(&self) -> PathBuf {
        let count = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.base
            .join(format!("blob.tmp.{}.{}", std::process::id(), count))
    }

    /// Move a finished temporary file into place under `digest`.
    ///
    /// An existing blob with the right size wins; the store is content
    /// addressed, so the bytes are identical by construction.
    fn commit_tmp(&self, tmp_path: &Path, digest: &str, size: u64) -> Result<(), FsError> {
        let blob_path = self.blob_path(digest);

        let _lock = self.mutex.lock().unwrap();

        if let Ok(metadata) = std::fs::metadata(&blob_path) {
            if metadata.is_file() && metadata.len() == size {
                std::fs::remove_file(tmp_path)?;
                return Ok(());
            }
            log::warn!(
                "blob '{}' exists with wrong size ({} != {}), overwriting",
                digest,
                metadata.len(),
                size
            );
        }

        // fan-out directories are created on demand
        if let Some(parent) = blob_path.parent() {
            create_path(parent, None, None)
                .map_err(|err| FsError::Other(format_err!("unable to create {:?} - {}", parent, err)))?;
        }
        std::fs::rename(tmp_path, &blob_path)?;
        Ok(())
    }
}

impl CasStore for LocalCasStore {
    fn get(&self, digest: &str) -> Result<Option<CasFile>, FsError> {
        check_digest(digest)?;
        let file = match std::fs::File::open(self.blob_path(digest)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata()?.len();
        Ok(Some(CasFile {
            digest: digest.to_string(),
            size,
            reader: Box::new(file),
        }))
    }

    fn put_scalar(&self, data: &[u8]) -> Result<String, FsError> {
        let mut cursor = Cursor::new(data);
        self.put_handle(&mut cursor)
    }

    fn put_handle(&self, reader: &mut dyn Read) -> Result<String, FsError> {
        let tmp_path = self.tmp_path();
        let mut tmp_file = std::fs::File::create(&tmp_path)?;

        let result = streaming_digest(reader, Some(&mut tmp_file));
        let (digest, size) = match result {
            Ok(ok) => ok,
            Err(err) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        };
        drop(tmp_file);

        if let Err(err) = self.commit_tmp(&tmp_path, &digest, size) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(digest)
    }

    fn validate(&self, digest: &str) -> Result<bool, FsError> {
        let mut file = match self.get(digest)? {
            Some(file) => file,
            None => return Ok(false),
        };
        let (computed, _size) = streaming_digest(&mut file, None::<&mut std::fs::File>)?;
        Ok(computed == digest)
    }

    fn hash_of_null(&self) -> &str {
        &self.null_digest
    }
}

/// In-memory blob store, mainly for tests and embedders without
/// persistent state.
pub struct MemoryCasStore {
    blobs: Mutex<HashMap<String, Arc<[u8]>>>,
    null_digest: String,
}

impl MemoryCasStore {
    pub fn new() -> Self {
        let store = Self {
            blobs: Mutex::new(HashMap::new()),
            null_digest: content_digest(&[]),
        };
        store
            .blobs
            .lock()
            .unwrap()
            .insert(store.null_digest.clone(), Arc::from(Vec::new()));
        store
    }
}

impl Default for MemoryCasStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CasStore for MemoryCasStore {
    fn get(&self, digest: &str) -> Result<Option<CasFile>, FsError> {
        check_digest(digest)?;
        let blob = match self.blobs.lock().unwrap().get(digest) {
            Some(blob) => Arc::clone(blob),
            None => return Ok(None),
        };
        Ok(Some(CasFile {
            digest: digest.to_string(),
            size: blob.len() as u64,
            reader: Box::new(Cursor::new(blob)),
        }))
    }

    fn put_scalar(&self, data: &[u8]) -> Result<String, FsError> {
        let digest = content_digest(data);
        self.blobs
            .lock()
            .unwrap()
            .entry(digest.clone())
            .or_insert_with(|| Arc::from(data.to_vec()));
        Ok(digest)
    }

    fn put_handle(&self, reader: &mut dyn Read) -> Result<String, FsError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.put_scalar(&data)
    }

    fn validate(&self, digest: &str) -> Result<bool, FsError> {
        check_digest(digest)?;
        match self.blobs.lock().unwrap().get(digest) {
            Some(blob) => Ok(content_digest(blob) == *digest),
            None => Ok(false),
        }
    }

    fn hash_of_null(&self) -> &str {
        &self.null_digest
    }
}
