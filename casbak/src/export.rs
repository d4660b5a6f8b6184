//! Extractor writing a stored tree back to a real filesystem.
//!
//! Directories are created first, children extracted into them, and
//! directory metadata applied last so restored modification times
//! survive. Failure to restore special files or ownership is logged
//! and counted but does not abort the export; a missing file blob
//! does.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use nix::errno::Errno;
use nix::sys::stat::{fchmodat, makedev, mknod, utimensat, FchmodatFlags, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{fchownat, mkfifo, FchownatFlags, Gid, Uid};

use casbak_store::{CasFs, DirEntry, EntryKind};

#[derive(Default)]
pub struct ExportStats {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub specials: u64,
    pub warnings: u64,
}

pub struct Extractor<'a> {
    fs: &'a CasFs,
    stats: ExportStats,
}

/// Extract a stored entry (directory or file) to `target`.
pub fn extract_entry(fs: &CasFs, entry: &DirEntry, target: &Path) -> Result<ExportStats, Error> {
    let mut extractor = Extractor {
        fs,
        stats: ExportStats::default(),
    };
    match entry.kind {
        EntryKind::Directory => extractor.extract_dir(entry, target)?,
        EntryKind::File => extractor.extract_file(entry, target)?,
        _ => bail!("refusing to extract a {:?} entry", entry.kind.as_str()),
    }
    Ok(extractor.stats)
}

fn entry_mode(entry: &DirEntry) -> Mode {
    Mode::from_bits_truncate(entry.stat.mode.unwrap_or(0o644))
}

impl<'a> Extractor<'a> {
    fn warn(&mut self, message: std::fmt::Arguments) {
        log::warn!("{}", message);
        self.stats.warnings += 1;
    }

    fn extract_dir(&mut self, entry: &DirEntry, target: &Path) -> Result<(), Error> {
        match std::fs::create_dir(target) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && target.is_dir() => (),
            Err(err) => return Err(format_err!("unable to create {:?} - {}", target, err)),
        }

        let digest = match entry.digest_ref() {
            Some(digest) => digest,
            None => {
                self.warn(format_args!(
                    "directory {:?} has no stored content, leaving it empty",
                    target
                ));
                return Ok(());
            }
        };
        let dir = self
            .fs
            .get_dir(digest)?
            .ok_or_else(|| format_err!("directory blob '{}' is not in storage", digest))?;

        for child in dir.entries() {
            let path = target.join(OsStr::from_bytes(&child.name));
            self.extract_child(child, &path)
                .map_err(|err| format_err!("error at {:?}: {}", path, err))?;
        }

        // after the children, so the restored mtime is not clobbered
        self.apply_metadata(entry, target, false);
        self.stats.directories += 1;
        Ok(())
    }

    fn extract_child(&mut self, entry: &DirEntry, path: &Path) -> Result<(), Error> {
        match entry.kind {
            EntryKind::Directory => self.extract_dir(entry, path),
            EntryKind::File => self.extract_file(entry, path),
            EntryKind::Symlink => self.extract_symlink(entry, path),
            EntryKind::BlockDevice | EntryKind::CharDevice => self.extract_device(entry, path),
            EntryKind::Fifo => self.extract_fifo(entry, path),
            EntryKind::Socket => {
                self.warn(format_args!("cannot restore socket {:?}", path));
                Ok(())
            }
        }
    }

    fn extract_file(&mut self, entry: &DirEntry, path: &Path) -> Result<(), Error> {
        let digest = entry
            .digest_ref()
            .ok_or_else(|| format_err!("file entry has no content reference"))?;
        let mut blob = self
            .fs
            .get(digest)?
            .ok_or_else(|| format_err!("file blob '{}' is not in storage", digest))?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        std::io::copy(&mut blob, &mut file)?;
        drop(file);

        self.apply_metadata(entry, path, false);
        self.stats.files += 1;
        Ok(())
    }

    fn extract_symlink(&mut self, entry: &DirEntry, path: &Path) -> Result<(), Error> {
        let target = entry
            .symlink_target()
            .ok_or_else(|| format_err!("symlink entry has no target"))?;
        std::os::unix::fs::symlink(OsStr::from_bytes(target), path)?;

        self.apply_metadata(entry, path, true);
        self.stats.symlinks += 1;
        Ok(())
    }

    fn extract_device(&mut self, entry: &DirEntry, path: &Path) -> Result<(), Error> {
        let ident = entry.reference.as_deref().unwrap_or(b"");
        let device = std::str::from_utf8(ident)
            .ok()
            .and_then(|ident| ident.split_once(':'))
            .and_then(|(major, minor)| {
                Some(makedev(major.parse().ok()?, minor.parse().ok()?))
            })
            .ok_or_else(|| {
                format_err!(
                    "malformed device identifier {:?}",
                    String::from_utf8_lossy(ident)
                )
            })?;

        let kind = match entry.kind {
            EntryKind::BlockDevice => SFlag::S_IFBLK,
            _ => SFlag::S_IFCHR,
        };
        match mknod(path, kind, entry_mode(entry), device) {
            Ok(()) => {
                self.apply_metadata(entry, path, false);
                self.stats.specials += 1;
            }
            Err(Errno::EPERM) => {
                self.warn(format_args!(
                    "cannot restore device node {:?} (not permitted)",
                    path
                ));
            }
            Err(err) => bail!("mknod {:?} failed - {}", path, err),
        }
        Ok(())
    }

    fn extract_fifo(&mut self, entry: &DirEntry, path: &Path) -> Result<(), Error> {
        match mkfifo(path, entry_mode(entry)) {
            Ok(()) => {
                self.apply_metadata(entry, path, false);
                self.stats.specials += 1;
            }
            Err(err) => {
                self.warn(format_args!("cannot restore fifo {:?} - {}", path, err));
            }
        }
        Ok(())
    }

    /// Restore ownership, permissions and timestamps as far as the
    /// running user is allowed to.
    fn apply_metadata(&mut self, entry: &DirEntry, path: &Path, is_symlink: bool) {
        let stat = &entry.stat;

        if stat.uid.is_some() || stat.gid.is_some() {
            let result = fchownat(
                None,
                path,
                stat.uid.map(Uid::from_raw),
                stat.gid.map(Gid::from_raw),
                FchownatFlags::NoFollowSymlink,
            );
            match result {
                Ok(()) | Err(Errno::EPERM) => (),
                Err(err) => {
                    self.warn(format_args!("chown {:?} failed - {}", path, err));
                }
            }
        }

        if let Some(mode) = stat.mode {
            if !is_symlink {
                let result = fchmodat(
                    None,
                    path,
                    Mode::from_bits_truncate(mode),
                    FchmodatFlags::FollowSymlink,
                );
                if let Err(err) = result {
                    self.warn(format_args!("chmod {:?} failed - {}", path, err));
                }
            }
        }

        if stat.modify_ts.is_some() || stat.atime.is_some() {
            let omit = TimeSpec::new(0, libc::UTIME_OMIT);
            let atime = stat.atime.map(|t| TimeSpec::new(t, 0)).unwrap_or(omit);
            let mtime = stat.modify_ts.map(|t| TimeSpec::new(t, 0)).unwrap_or(omit);
            let result = utimensat(None, path, &atime, &mtime, UtimensatFlags::NoFollowSymlink);
            if let Err(err) = result {
                self.warn(format_args!("utimensat {:?} failed - {}", path, err));
            }
        }
    }
}
