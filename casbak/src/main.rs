use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use pathpatterns::{MatchEntry, MatchType, PatternFlag};
use proxmox_human_byte::HumanByte;
use proxmox_router::cli::*;
use proxmox_schema::api;
use proxmox_time::{epoch_i64, strftime_local};

use casbak_store::file_formats::{DEFAULT_FORMAT, MINIMAL_FORMAT};
use casbak_store::{BackupConfig, BackupRoot, DirEntry, EntryKind, SnapshotRecord};

mod export;
mod import;

fn backup_root(backup_dir: Option<&str>) -> Result<BackupRoot, Error> {
    BackupRoot::open(Path::new(backup_dir.unwrap_or(".")))
}

fn select_snapshot(
    records: &[SnapshotRecord],
    snapshot: Option<u64>,
) -> Result<&SnapshotRecord, Error> {
    match snapshot {
        Some(index) => records
            .get(index as usize)
            .ok_or_else(|| format_err!("no snapshot with index {}", index)),
        None => records
            .last()
            .ok_or_else(|| format_err!("backup directory has no snapshots")),
    }
}

fn mode_string(entry: &DirEntry) -> String {
    let kind = match entry.kind {
        EntryKind::File => '-',
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::CharDevice => 'c',
        EntryKind::BlockDevice => 'b',
        EntryKind::Fifo => 'p',
        EntryKind::Socket => 's',
    };
    let mode = entry.stat.mode.unwrap_or(0);

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}

fn format_mtime(entry: &DirEntry) -> String {
    match entry.stat.modify_ts {
        Some(mtime) => {
            strftime_local("%F %T", mtime).unwrap_or_else(|_| mtime.to_string())
        }
        None => "-".to_string(),
    }
}

fn format_entry_line(entry: &DirEntry) -> String {
    let (size, link) = match entry.kind {
        EntryKind::File => (entry.stat.size.unwrap_or(0).to_string(), String::new()),
        EntryKind::Symlink => (
            "0".to_string(),
            match entry.symlink_target() {
                Some(target) => format!(" -> {:?}", String::from_utf8_lossy(target)),
                None => String::new(),
            },
        ),
        EntryKind::CharDevice | EntryKind::BlockDevice => (
            String::from_utf8_lossy(entry.reference.as_deref().unwrap_or(b"0:0")).to_string(),
            String::new(),
        ),
        _ => ("0".to_string(), String::new()),
    };
    let owner = format!(
        "{}/{}",
        entry.stat.uid.unwrap_or(0),
        entry.stat.gid.unwrap_or(0)
    );

    format!(
        "{} {:<11} {} {:>10} {:?}{}",
        mode_string(entry),
        owner,
        format_mtime(entry),
        size,
        String::from_utf8_lossy(&entry.name),
        link,
    )
}

#[api(
    input: {
        properties: {
            "backup-dir": {
                description: "The backup directory.",
                optional: true,
            },
            format: {
                description: "Directory codec for new snapshots ('json' or 'minimal').",
                optional: true,
            },
            "case-insensitive": {
                description: "Fold entry name lookups (stored names keep their case).",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Initialize a new backup directory.
fn init(
    backup_dir: Option<String>,
    format: Option<String>,
    case_insensitive: bool,
) -> Result<(), Error> {
    let format = match format.as_deref() {
        None | Some("json") => DEFAULT_FORMAT.to_string(),
        Some("minimal") => MINIMAL_FORMAT.to_string(),
        Some(other) => bail!("unknown directory format '{}'", other),
    };

    let config = BackupConfig {
        format,
        case_insensitive,
        ..Default::default()
    };
    let root = BackupRoot::init(Path::new(backup_dir.as_deref().unwrap_or(".")), config)?;
    log::info!("initialized backup directory {:?}", root.path());
    Ok(())
}

#[api(
    input: {
        properties: {
            source: {
                description: "Directory tree to import.",
            },
            "backup-dir": {
                description: "The backup directory.",
                optional: true,
            },
            comment: {
                description: "Comment stored with the snapshot.",
                optional: true,
            },
            exclude: {
                description: "List of paths or pattern matching files to exclude.",
                optional: true,
                type: Array,
                items: {
                    description: "Path or pattern matching files to exclude.",
                    type: String,
                },
            },
            "allow-noop": {
                description: "Treat an import without any changes as success.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Import a directory tree as a new snapshot.
async fn import(
    source: String,
    backup_dir: Option<String>,
    comment: Option<String>,
    exclude: Option<Vec<String>>,
    allow_noop: bool,
) -> Result<(), Error> {
    let mut patterns = Vec::new();
    for pattern in exclude.unwrap_or_default() {
        patterns.push(
            MatchEntry::parse_pattern(pattern, PatternFlag::PATH_NAME, MatchType::Exclude)
                .map_err(|err| format_err!("error in exclude pattern: {}", err))?,
        );
    }

    let backup_root = backup_root(backup_dir.as_deref())?;
    let (fs, previous) = backup_root.open_latest()?;

    let (root, stats) = import::import_tree(
        &fs,
        Path::new(&source),
        previous.as_ref().map(|record| &record.root),
        patterns,
    )?;

    if let Some(previous) = &previous {
        if previous.root.digest_ref() == root.digest_ref() {
            log::info!("no changes since the previous snapshot");
            if allow_noop {
                return Ok(());
            }
            std::process::exit(1);
        }
    }

    backup_root.snapshots().append(&SnapshotRecord {
        time: epoch_i64(),
        root: root.clone(),
        comment,
    })?;

    log::info!(
        "stored {} directories and {} files ({} unchanged, {} of new file data, {} skipped)",
        stats.directories,
        stats.files,
        stats.reused_files,
        HumanByte::from(stats.bytes_stored),
        stats.skipped,
    );
    log::info!("snapshot root {}", root.digest_ref().unwrap_or("-"));
    Ok(())
}

#[api(
    input: {
        properties: {
            target: {
                description: "Target directory.",
            },
            "backup-dir": {
                description: "The backup directory.",
                optional: true,
            },
            path: {
                description: "Path inside the snapshot to extract (defaults to the whole tree).",
                optional: true,
            },
            snapshot: {
                description: "Snapshot index as listed by 'log' (defaults to the latest).",
                optional: true,
                minimum: 0,
            },
        },
    },
)]
/// Export a snapshot (or part of it) to a local directory.
async fn export(
    target: String,
    backup_dir: Option<String>,
    path: Option<String>,
    snapshot: Option<u64>,
) -> Result<(), Error> {
    let backup_root = backup_root(backup_dir.as_deref())?;
    let records = backup_root.snapshots().list()?;
    let record = select_snapshot(&records, snapshot)?;

    let fs = backup_root.filesystem(Some(record.root.clone()))?;
    let entry = match &path {
        Some(path) => fs.path(path).entry()?,
        None => fs.root_entry(),
    };

    let stats = export::extract_entry(&fs, &entry, &PathBuf::from(&target))?;
    log::info!(
        "restored {} directories, {} files, {} symlinks, {} special files ({} warnings)",
        stats.directories,
        stats.files,
        stats.symlinks,
        stats.specials,
        stats.warnings,
    );
    Ok(())
}

#[api(
    input: {
        properties: {
            "backup-dir": {
                description: "The backup directory.",
                optional: true,
            },
        },
    },
)]
/// List the snapshots of a backup directory.
fn list_snapshots(backup_dir: Option<String>) -> Result<(), Error> {
    let backup_root = backup_root(backup_dir.as_deref())?;
    let records = backup_root.snapshots().list()?;

    for (index, record) in records.iter().enumerate() {
        let time =
            strftime_local("%F %T", record.time).unwrap_or_else(|_| record.time.to_string());
        println!(
            "{:>4} {} {} {}",
            index,
            time,
            record.root.digest_ref().unwrap_or("-"),
            record.comment.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

#[api(
    input: {
        properties: {
            path: {
                description: "Path inside the snapshot.",
                optional: true,
            },
            "backup-dir": {
                description: "The backup directory.",
                optional: true,
            },
            snapshot: {
                description: "Snapshot index as listed by 'log' (defaults to the latest).",
                optional: true,
                minimum: 0,
            },
        },
    },
)]
/// List the content of a directory inside a snapshot.
fn list_directory(
    path: Option<String>,
    backup_dir: Option<String>,
    snapshot: Option<u64>,
) -> Result<(), Error> {
    let backup_root = backup_root(backup_dir.as_deref())?;
    let records = backup_root.snapshots().list()?;
    let record = select_snapshot(&records, snapshot)?;

    let fs = backup_root.filesystem(Some(record.root.clone()))?;
    let entry = fs.path(path.as_deref().unwrap_or("/")).entry()?;

    if entry.is_directory() {
        let digest = entry
            .digest_ref()
            .ok_or_else(|| format_err!("directory is not present in storage"))?;
        let dir = fs
            .get_dir(digest)?
            .ok_or_else(|| format_err!("directory blob '{}' is not in storage", digest))?;
        for child in dir.entries() {
            println!("{}", format_entry_line(child));
        }
    } else {
        println!("{}", format_entry_line(&entry));
    }
    Ok(())
}

fn main() {
    init_cli_logger("CASBAK_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "init",
            CliCommand::new(&API_METHOD_INIT).completion_cb("backup-dir", complete_file_name),
        )
        .insert(
            "import",
            CliCommand::new(&API_METHOD_IMPORT)
                .arg_param(&["source"])
                .completion_cb("source", complete_file_name)
                .completion_cb("backup-dir", complete_file_name),
        )
        .insert(
            "export",
            CliCommand::new(&API_METHOD_EXPORT)
                .arg_param(&["target"])
                .completion_cb("target", complete_file_name)
                .completion_cb("backup-dir", complete_file_name),
        )
        .insert(
            "log",
            CliCommand::new(&API_METHOD_LIST_SNAPSHOTS)
                .completion_cb("backup-dir", complete_file_name),
        )
        .insert(
            "ls",
            CliCommand::new(&API_METHOD_LIST_DIRECTORY)
                .arg_param(&["path"])
                .completion_cb("backup-dir", complete_file_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
