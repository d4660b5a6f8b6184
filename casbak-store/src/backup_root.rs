//! A backup directory on disk.
//!
//! Bundles the pieces persisted under one backup root: the config, the
//! local blob store and the snapshot journal, plus constructors for
//! filesystem instances over them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};

use crate::cas::LocalCasStore;
use crate::config::{BackupConfig, CONFIG_NAME};
use crate::dir_entry::DirEntry;
use crate::filesystem::{CasFs, FsOptions};
use crate::snapshot_log::{SnapshotLog, SnapshotRecord, SNAPSHOT_LOG_NAME};

pub const BLOB_DIR_NAME: &str = ".blobs";

pub struct BackupRoot {
    path: PathBuf,
    config: BackupConfig,
    store: Arc<LocalCasStore>,
    snapshots: SnapshotLog,
}

impl BackupRoot {
    /// Initialize a fresh backup directory.
    pub fn init(path: &Path, config: BackupConfig) -> Result<Self, Error> {
        if path.join(CONFIG_NAME).exists() {
            bail!("backup directory {:?} is already initialized", path);
        }
        proxmox_sys::fs::create_path(path, None, None)
            .map_err(|err| format_err!("unable to create {:?} - {}", path, err))?;

        config.store(path)?;
        LocalCasStore::create(path.join(BLOB_DIR_NAME))?;
        SnapshotLog::create(path.join(SNAPSHOT_LOG_NAME))?;

        Self::open(path)
    }

    /// Open an existing backup directory.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let config = BackupConfig::load(path)?;
        let store = Arc::new(LocalCasStore::open(path.join(BLOB_DIR_NAME))?);
        let snapshots = SnapshotLog::new(path.join(SNAPSHOT_LOG_NAME));

        Ok(Self {
            path: path.to_owned(),
            config,
            store,
            snapshots,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<LocalCasStore> {
        Arc::clone(&self.store)
    }

    pub fn snapshots(&self) -> &SnapshotLog {
        &self.snapshots
    }

    fn fs_options(&self) -> FsOptions {
        FsOptions {
            case_insensitive: self.config.case_insensitive,
            format: self.config.format.clone(),
            ..Default::default()
        }
    }

    /// A filesystem over this store rooted at `root_entry`.
    pub fn filesystem(&self, root_entry: Option<DirEntry>) -> Result<CasFs, Error> {
        Ok(CasFs::new(self.store(), root_entry, self.fs_options())?)
    }

    /// A filesystem rooted at the latest snapshot (or empty when there
    /// is none yet), along with that snapshot's record.
    pub fn open_latest(&self) -> Result<(CasFs, Option<SnapshotRecord>), Error> {
        let latest = self.snapshots.latest()?;
        let fs = self.filesystem(latest.as_ref().map(|record| record.root.clone()))?;
        Ok((fs, latest))
    }
}
