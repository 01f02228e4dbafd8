//! Recovery: integrity checking and rebuild of the indexed store from the
//! append log.
//!
//! The log is authoritative. A rebuild replays every record through the same
//! `apply_record` path live writes use, into a fresh database beside the live
//! one, then atomically renames it into place. Interrupting a rebuild leaves
//! the live store untouched; re-running discards the partial file and starts
//! over.

use std::path::Path;

use tracing::{info, warn};

use crate::applog::AppendLog;
use crate::error::{Error, Result, StoreError};
use crate::store::{REQUIRED_TABLES, RunStore};

/// Outcome of [`check_integrity`].
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    /// SQLite's `integrity_check` verdict.
    pub integrity_ok: bool,
    /// Messages from `integrity_check` when it is not "ok".
    pub findings: Vec<String>,
    /// Required tables that are absent.
    pub missing_tables: Vec<String>,
    pub run_count: i64,
    pub event_count: i64,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.integrity_ok && self.missing_tables.is_empty()
    }
}

/// `PRAGMA integrity_check` plus required-table presence.
pub fn check_integrity(store: &RunStore) -> Result<IntegrityReport> {
    let conn = store.connection();

    let mut findings = Vec::new();
    let mut stmt = conn
        .prepare("PRAGMA integrity_check")
        .map_err(StoreError::from)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(StoreError::from)?;
    for row in rows {
        let message = row.map_err(StoreError::from)?;
        if message != "ok" {
            findings.push(message);
        }
    }
    let integrity_ok = findings.is_empty();

    let mut missing_tables = Vec::new();
    for table in REQUIRED_TABLES {
        let present: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(StoreError::from)?;
        if present == 0 {
            missing_tables.push((*table).to_string());
        }
    }

    let (run_count, event_count) = if missing_tables.is_empty() {
        (store.run_count()?, store.event_count()?)
    } else {
        (0, 0)
    };

    let report = IntegrityReport {
        integrity_ok,
        findings,
        missing_tables,
        run_count,
        event_count,
    };
    if !report.is_healthy() {
        warn!(
            findings = report.findings.len(),
            missing_tables = ?report.missing_tables,
            "integrity check failed"
        );
    }
    Ok(report)
}

/// Outcome of [`rebuild`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildStats {
    pub records_applied: u64,
    pub records_duplicate: u64,
    pub runs: i64,
}

/// Rebuild the indexed store at `db_path` from the full append log.
///
/// Works in `<db>.rebuild` so readers of the live file are unaffected until
/// the final rename. Safe to re-run after an interruption.
pub fn rebuild(log: &AppendLog, db_path: &Path) -> Result<RebuildStats> {
    let staging = db_path.with_extension("db.rebuild");
    discard_sqlite_files(&staging)?;

    let mut stats = RebuildStats::default();
    {
        let mut store = RunStore::open(&staging)?;
        for entry in log.replay()? {
            let (_, record) = entry?;
            if store.apply_record(&record)? {
                stats.records_applied += 1;
            } else {
                stats.records_duplicate += 1;
            }
        }
        stats.runs = store.run_count()?;
        // Fold the WAL into the main file before the rename.
        store
            .connection()
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(StoreError::from)?;
    }

    discard_sqlite_files(db_path)?;
    std::fs::rename(&staging, db_path)?;
    info!(
        records = stats.records_applied,
        runs = stats.runs,
        path = %db_path.display(),
        "rebuilt indexed store from append log"
    );
    Ok(stats)
}

/// Verify the store at `db_path`, rebuilding it from the log when it is
/// unreadable or fails integrity checks.
///
/// Returns `None` when the store was already healthy, `Some(stats)` after a
/// rebuild. A store that is still unhealthy after rebuilding is an error;
/// callers must not serve from it.
pub fn ensure_healthy(log: &AppendLog, db_path: &Path) -> Result<Option<RebuildStats>> {
    match RunStore::open(db_path) {
        Ok(store) => {
            let report = check_integrity(&store)?;
            if report.is_healthy() {
                return Ok(None);
            }
            warn!(
                findings = report.findings.len(),
                missing_tables = ?report.missing_tables,
                "indexed store unhealthy; rebuilding from append log"
            );
        }
        Err(Error::Store(StoreError::Corruption { details })) => {
            warn!(%details, "indexed store unreadable; rebuilding from append log");
        }
        Err(e) => return Err(e),
    }

    let stats = rebuild(log, db_path)?;
    let report = check_integrity(&RunStore::open(db_path)?)?;
    if !report.is_healthy() {
        return Err(StoreError::Corruption {
            details: "indexed store still unhealthy after rebuild".to_string(),
        }
        .into());
    }
    Ok(Some(stats))
}

/// Remove a database file and its WAL/SHM companions.
pub(crate) fn discard_sqlite_files(path: &Path) -> Result<()> {
    for candidate in [
        path.to_path_buf(),
        append_ext(path, "-wal"),
        append_ext(path, "-shm"),
    ] {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn append_ext(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    std::path::PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogPayload, LogRecord, RunPatch};
    use crate::status::RunStatus;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn open_log(dir: &Path) -> AppendLog {
        AppendLog::open(
            dir.join("events.log"),
            dir.join("events.lock"),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    fn start_record(event_id: &str) -> LogRecord {
        LogRecord::new(
            event_id,
            format!("run-{event_id}"),
            LogPayload::Start {
                parent_run_id: None,
                agent_name: "scraper".to_string(),
                job_type: "crawl".to_string(),
                start_time: Utc::now(),
                context: None,
            },
        )
    }

    #[test]
    fn healthy_store_passes_integrity() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.db")).unwrap();
        let report = check_integrity(&store).unwrap();
        assert!(report.is_healthy());
        assert_eq!(report.run_count, 0);
    }

    #[test]
    fn rebuild_restores_log_present_store_missing_records() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let db_path = dir.path().join("runs.db");

        // Two records reached the log; only the first reached the store
        // before a simulated crash.
        let r1 = start_record("ev-1");
        let r2 = LogRecord::new(
            "ev-1",
            "run-ev-1",
            LogPayload::End {
                patch: RunPatch {
                    status: Some(RunStatus::Success),
                    end_time: Some(Utc::now()),
                    items_succeeded: Some(7),
                    ..RunPatch::default()
                },
            },
        );
        log.append(&r1).unwrap();
        log.append(&r2).unwrap();
        {
            let mut store = RunStore::open(&db_path).unwrap();
            store.apply_record(&r1).unwrap();
        }

        let stats = rebuild(&log, &db_path).unwrap();
        assert_eq!(stats.records_applied, 2);
        assert_eq!(stats.runs, 1);

        let store = RunStore::open(&db_path).unwrap();
        let run = store.get_run("ev-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.items_succeeded, 7);
    }

    #[test]
    fn rebuild_is_repeatable() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let db_path = dir.path().join("runs.db");
        log.append(&start_record("ev-1")).unwrap();
        log.append(&start_record("ev-2")).unwrap();

        let first = rebuild(&log, &db_path).unwrap();
        let second = rebuild(&log, &db_path).unwrap();
        assert_eq!(first.runs, 2);
        assert_eq!(second.runs, 2);
        assert_eq!(second.records_applied, 2);

        let store = RunStore::open(&db_path).unwrap();
        assert_eq!(store.event_count().unwrap(), 2);
    }

    #[test]
    fn ensure_healthy_is_a_noop_on_a_healthy_store() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let db_path = dir.path().join("runs.db");
        log.append(&start_record("ev-1")).unwrap();
        rebuild(&log, &db_path).unwrap();

        assert!(ensure_healthy(&log, &db_path).unwrap().is_none());
    }

    #[test]
    fn ensure_healthy_rebuilds_an_unreadable_store() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let db_path = dir.path().join("runs.db");
        log.append(&start_record("ev-1")).unwrap();
        log.append(&start_record("ev-2")).unwrap();

        // The database file was overwritten with garbage.
        std::fs::write(&db_path, b"this is not a database").unwrap();

        let stats = ensure_healthy(&log, &db_path).unwrap().expect("rebuild expected");
        assert_eq!(stats.runs, 2);

        let store = RunStore::open(&db_path).unwrap();
        assert!(store.get_run("ev-1").unwrap().is_some());
        assert!(check_integrity(&store).unwrap().is_healthy());
    }

    #[test]
    fn ensure_healthy_rebuilds_when_tables_are_missing() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let db_path = dir.path().join("runs.db");
        log.append(&start_record("ev-1")).unwrap();
        rebuild(&log, &db_path).unwrap();

        {
            let store = RunStore::open(&db_path).unwrap();
            store
                .connection()
                .execute_batch("DROP TABLE events; DROP TABLE commits; DROP TABLE runs;")
                .unwrap();
        }

        let stats = ensure_healthy(&log, &db_path).unwrap().expect("rebuild expected");
        assert_eq!(stats.runs, 1);
        let store = RunStore::open(&db_path).unwrap();
        assert!(store.get_run("ev-1").unwrap().is_some());
    }

    #[test]
    fn rebuild_discards_stale_staging_file() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let db_path = dir.path().join("runs.db");
        log.append(&start_record("ev-1")).unwrap();

        // Leftover junk from an interrupted earlier rebuild.
        std::fs::write(db_path.with_extension("db.rebuild"), b"not a database").unwrap();

        let stats = rebuild(&log, &db_path).unwrap();
        assert_eq!(stats.runs, 1);
        let store = RunStore::open(&db_path).unwrap();
        assert!(check_integrity(&store).unwrap().is_healthy());
    }
}
