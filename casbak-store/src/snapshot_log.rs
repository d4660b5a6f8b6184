//! Snapshot journal.
//!
//! A backup directory keeps an append-only log of snapshot roots: one
//! json line per snapshot with the commit time, the root entry and an
//! optional comment. The root entry is all a reader needs to open the
//! snapshot again.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::format_err;
use serde_json::{json, Value};

use crate::dir_codec::json::{entry_from_json, entry_to_json};
use crate::dir_entry::DirEntry;
use crate::error::FsError;

pub const SNAPSHOT_LOG_NAME: &str = "snapshots.log";

#[derive(Clone)]
pub struct SnapshotRecord {
    /// Commit time (unix epoch).
    pub time: i64,
    /// The root entry naming the snapshot.
    pub root: DirEntry,
    pub comment: Option<String>,
}

impl SnapshotRecord {
    fn to_json(&self) -> Result<Value, FsError> {
        let mut record = json!({
            "time": self.time,
            "root": entry_to_json(&self.root)?,
        });
        if let Some(comment) = &self.comment {
            record["comment"] = Value::String(comment.clone());
        }
        Ok(record)
    }

    fn from_json(value: &Value) -> Result<Self, FsError> {
        let time = value["time"]
            .as_i64()
            .ok_or_else(|| FsError::Other(format_err!("snapshot record without time")))?;
        let root = entry_from_json(&value["root"])?;
        if !root.is_directory() {
            return Err(FsError::Other(format_err!(
                "snapshot root entry is not a directory"
            )));
        }
        let comment = value["comment"].as_str().map(str::to_owned);
        Ok(Self {
            time,
            root,
            comment,
        })
    }
}

pub struct SnapshotLog {
    path: PathBuf,
}

impl SnapshotLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Create an empty log file.
    pub fn create<P: Into<PathBuf>>(path: P) -> Result<Self, FsError> {
        let log = Self::new(path);
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&log.path)?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one snapshot record.
    pub fn append(&self, record: &SnapshotRecord) -> Result<(), FsError> {
        let mut line = serde_json::to_vec(&record.to_json()?)
            .map_err(|err| FsError::Other(format_err!("unable to serialize snapshot - {}", err)))?;
        line.push(b'\n');

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// All snapshots, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotRecord>, FsError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line)
                .map_err(|err| FsError::Other(format_err!("malformed snapshot record - {}", err)))?;
            records.push(SnapshotRecord::from_json(&value)?);
        }
        Ok(records)
    }

    /// The most recent snapshot, if any.
    pub fn latest(&self) -> Result<Option<SnapshotRecord>, FsError> {
        Ok(self.list()?.pop())
    }
}
