//! Per backup directory configuration.

use std::path::Path;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use proxmox_sys::fs::{file_get_json, replace_file, CreateOptions};

use crate::dir_codec::lookup_codec;
use crate::file_formats::DEFAULT_FORMAT;

pub const CONFIG_NAME: &str = "casbak.conf";

fn default_version() -> u32 {
    1
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Format tag of the directory codec for newly written directories.
    #[serde(default)]
    pub format: String,
    /// Fold name lookups (stored names keep their case).
    #[serde(default)]
    pub case_insensitive: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            version: 1,
            format: DEFAULT_FORMAT.to_string(),
            case_insensitive: false,
        }
    }
}

impl BackupConfig {
    pub fn load(backup_dir: &Path) -> Result<Self, Error> {
        let path = backup_dir.join(CONFIG_NAME);
        let data = file_get_json(&path, None)
            .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;
        let config: Self = serde_json::from_value(data)
            .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;

        if config.version != 1 {
            bail!("unsupported config version {}", config.version);
        }
        if lookup_codec(&config.format).is_none() {
            bail!("config names unknown directory format {:?}", config.format);
        }
        Ok(config)
    }

    pub fn store(&self, backup_dir: &Path) -> Result<(), Error> {
        let path = backup_dir.join(CONFIG_NAME);
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        replace_file(path, &data, CreateOptions::new(), true)?;
        Ok(())
    }
}
