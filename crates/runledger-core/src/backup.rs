//! Snapshots of the indexed store via SQLite's online backup API.
//!
//! A backup is a convenience for fast restore; the append log stays the
//! ground truth and `recovery::rebuild` is the authoritative path. Every
//! snapshot is integrity-checked right after the copy so a corrupt backup
//! is caught at creation time, not at restore time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::recovery::discard_sqlite_files;

/// Snapshot the live database into `backups_dir/runs-<timestamp>.db`.
///
/// Uses the online backup API, so live readers and writers are not blocked
/// for the duration of the copy.
pub fn create(db_path: &Path, backups_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(backups_dir)?;
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let backup_path = backups_dir.join(format!("runs-{stamp}.db"));

    let src = Connection::open(db_path).map_err(StoreError::from)?;
    let mut dst = Connection::open(&backup_path).map_err(StoreError::from)?;
    let backup = rusqlite::backup::Backup::new(&src, &mut dst).map_err(StoreError::from)?;
    backup
        .run_to_completion(100, Duration::from_millis(25), None)
        .map_err(StoreError::from)?;
    drop(backup);
    drop(dst);

    verify(&backup_path)?;
    info!(path = %backup_path.display(), "backup created and verified");
    Ok(backup_path)
}

/// `PRAGMA integrity_check` on a snapshot file.
pub fn verify(backup_path: &Path) -> Result<()> {
    if !backup_path.exists() {
        return Err(StoreError::NotFound(backup_path.display().to_string()).into());
    }
    let conn = Connection::open(backup_path).map_err(StoreError::from)?;
    let verdict: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(StoreError::from)?;
    if verdict != "ok" {
        return Err(StoreError::Corruption {
            details: format!("backup {}: {verdict}", backup_path.display()),
        }
        .into());
    }
    Ok(())
}

/// Replace the live database with a verified snapshot.
pub fn restore(backup_path: &Path, db_path: &Path) -> Result<()> {
    verify(backup_path)?;
    discard_sqlite_files(db_path)?;
    std::fs::copy(backup_path, db_path)?;
    info!(
        from = %backup_path.display(),
        to = %db_path.display(),
        "restored indexed store from backup"
    );
    Ok(())
}

/// Snapshot files in a backups directory, newest first by name.
pub fn list(backups_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    if !backups_dir.exists() {
        return Ok(entries);
    }
    for entry in std::fs::read_dir(backups_dir)? {
        let path = entry?.path();
        let is_snapshot = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("runs-") && n.ends_with(".db"));
        if is_snapshot {
            entries.push(path);
        }
    }
    entries.sort();
    entries.reverse();
    Ok(entries)
}
