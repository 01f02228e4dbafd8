//! Indexed store: the queryable SQLite projection of the append log.
//!
//! The log is ground truth; every row here can be reconstructed by replaying
//! it through [`RunStore::apply_record`], which is the single write path
//! shared by live writes and recovery rebuild. Replay is idempotent: event
//! rows dedupe on `record_uid` and checkpoint counters are absolute.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::model::{CommitRef, LogPayload, LogRecord, Run, RunPatch};
use crate::status::RunStatus;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Applied to every new connection before any other statement.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = FULL;
    PRAGMA busy_timeout = 30000;
    PRAGMA wal_autocheckpoint = 1000;
    PRAGMA foreign_keys = ON;
";

/// Versioned migrations, applied in order inside one transaction each.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "
    CREATE TABLE IF NOT EXISTS runs (
        event_id         TEXT PRIMARY KEY,
        run_id           TEXT NOT NULL,
        parent_run_id    TEXT,
        agent_name       TEXT NOT NULL DEFAULT '',
        job_type         TEXT NOT NULL DEFAULT '',
        status           TEXT NOT NULL CHECK (status IN
            ('running','success','failure','partial','timeout','cancelled')),
        items_discovered INTEGER NOT NULL DEFAULT 0 CHECK (items_discovered >= 0),
        items_succeeded  INTEGER NOT NULL DEFAULT 0 CHECK (items_succeeded >= 0),
        items_failed     INTEGER NOT NULL DEFAULT 0 CHECK (items_failed >= 0),
        items_skipped    INTEGER NOT NULL DEFAULT 0 CHECK (items_skipped >= 0),
        duration_secs    REAL CHECK (duration_secs IS NULL OR duration_secs >= 0),
        start_time       TEXT NOT NULL,
        end_time         TEXT,
        metrics          TEXT,
        context          TEXT,
        api_posted       INTEGER NOT NULL DEFAULT 0,
        api_posted_at    TEXT,
        api_retry_count  INTEGER NOT NULL DEFAULT 0 CHECK (api_retry_count >= 0),
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uid   TEXT NOT NULL UNIQUE,
        run_event_id TEXT NOT NULL REFERENCES runs(event_id),
        run_id       TEXT NOT NULL,
        event_type   TEXT NOT NULL,
        ts           TEXT NOT NULL,
        payload      TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS commits (
        commit_hash  TEXT PRIMARY KEY,
        run_event_id TEXT NOT NULL REFERENCES runs(event_id),
        message      TEXT,
        author       TEXT,
        committed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
    CREATE INDEX IF NOT EXISTS idx_runs_start_time ON runs(start_time);
    CREATE INDEX IF NOT EXISTS idx_runs_agent_status_created
        ON runs(agent_name, status, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_runs_job_type ON runs(job_type);
    CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run_id);
    CREATE INDEX IF NOT EXISTS idx_runs_api_posted ON runs(api_posted);
    CREATE INDEX IF NOT EXISTS idx_runs_run_id ON runs(run_id);
    CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_event_id);
    CREATE INDEX IF NOT EXISTS idx_commits_run ON commits(run_event_id);
    ",
)];

/// Tables whose absence means the store is structurally broken.
pub const REQUIRED_TABLES: &[&str] = &["runs", "events", "commits", "schema_migrations"];

const RUN_COLUMNS: &str = "event_id, run_id, parent_run_id, agent_name, job_type, status, \
     items_discovered, items_succeeded, items_failed, items_skipped, duration_secs, \
     start_time, end_time, metrics, context, api_posted, api_posted_at, api_retry_count, \
     created_at, updated_at";

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Query filter: AND across dimensions, OR within `statuses`.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub statuses: Vec<RunStatus>,
    pub agent_name: Option<String>,
    pub job_type: Option<String>,
    pub run_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

/// Handle on the SQLite projection. One connection per store; open more
/// stores for more connections (each gets the full pragma set).
#[derive(Debug)]
pub struct RunStore {
    conn: Connection,
    path: PathBuf,
}

impl RunStore {
    /// Open (creating and migrating if needed) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path).map_err(StoreError::from)?;
        conn.execute_batch(CONNECTION_PRAGMAS)
            .map_err(StoreError::from)?;
        let mut store = Self { conn, path };
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version    INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        let current: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        for &(version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            tx.execute_batch(sql)
                .map_err(|e| StoreError::Migration(format!("migration {version}: {e}")))?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, fmt_ts(&Utc::now())],
            )
            .map_err(|e| StoreError::Migration(e.to_string()))?;
            tx.commit()
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            info!(version, "applied schema migration");
        }
        Ok(())
    }

    // -- writes -------------------------------------------------------------

    /// Idempotent insert-or-update of a full run row. `created_at` is
    /// preserved on conflict; `updated_at` always advances.
    pub fn upsert_run(&self, run: &Run) -> Result<()> {
        write_run(&self.conn, run)
    }

    /// The one write path shared by live writes and rebuild: record the
    /// event row and fold the payload into the run row, atomically.
    ///
    /// Returns `false` when the record was already applied (duplicate
    /// `record_uid`), which is how replay stays idempotent.
    pub fn apply_record(&mut self, record: &LogRecord) -> Result<bool> {
        // Duplicates first: re-applying an already-applied record must leave
        // the store byte-identical, including `updated_at`.
        let seen: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM events WHERE record_uid = ?1)",
                params![record.record_uid],
                |row| row.get(0),
            )
            .map_err(StoreError::from)?;
        if seen {
            debug!(record_uid = %record.record_uid, "record already applied, skipping");
            return Ok(false);
        }

        let projected = self.project(record)?;

        let tx = self.conn.transaction().map_err(StoreError::from)?;

        // The run row first so the event FK holds.
        write_run(&tx, &projected)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO events (record_uid, run_event_id, run_id, event_type, ts, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.record_uid,
                    record.event_id,
                    record.run_id,
                    record.event_type().as_str(),
                    fmt_ts(&record.ts),
                    serde_json::to_string(&record.payload)?,
                ],
            )
            .map_err(StoreError::from)?;

        if let LogPayload::Commit {
            commit_hash,
            message,
            author,
        } = &record.payload
        {
            tx.execute(
                "INSERT OR IGNORE INTO commits (commit_hash, run_event_id, message, author, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    commit_hash,
                    record.event_id,
                    message,
                    author,
                    fmt_ts(&record.ts)
                ],
            )
            .map_err(StoreError::from)?;
        }

        tx.commit().map_err(StoreError::from)?;
        Ok(inserted > 0)
    }

    /// Fold a record into the run row it targets. Counters in the payload
    /// are absolute values, so re-projection is stable.
    fn project(&self, record: &LogRecord) -> Result<Run> {
        let existing = self.get_run(&record.event_id)?;
        let mut run = match &record.payload {
            LogPayload::Start {
                parent_run_id,
                agent_name,
                job_type,
                start_time,
                context,
            } => {
                let mut run =
                    existing.unwrap_or_else(|| Run::new(&record.event_id, &record.run_id));
                run.run_id.clone_from(&record.run_id);
                run.parent_run_id.clone_from(parent_run_id);
                run.agent_name.clone_from(agent_name);
                run.job_type.clone_from(job_type);
                run.start_time = *start_time;
                if context.is_some() {
                    run.context.clone_from(context);
                }
                run
            }
            LogPayload::Checkpoint { patch } | LogPayload::End { patch } => {
                patch.validate()?;
                let mut run = existing.unwrap_or_else(|| {
                    // Checkpoint for a run whose start record was lost to a
                    // torn tail; keep the facts we have.
                    let mut r = Run::new(&record.event_id, &record.run_id);
                    r.start_time = record.ts;
                    r
                });
                apply_patch(&mut run, patch);
                run
            }
            LogPayload::Commit { .. } => existing.unwrap_or_else(|| {
                let mut r = Run::new(&record.event_id, &record.run_id);
                r.start_time = record.ts;
                r
            }),
        };
        run.updated_at = Utc::now();
        run.validate()?;
        Ok(run)
    }

    // -- reads --------------------------------------------------------------

    /// Direct primary-key lookup; `Ok(None)` when absent.
    pub fn get_run(&self, event_id: &str) -> Result<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE event_id = ?1");
        let run = self
            .conn
            .query_row(&sql, params![event_id], run_from_row)
            .optional()
            .map_err(StoreError::from)?;
        Ok(run)
    }

    /// Most recently created run sharing a lineage `run_id`.
    pub fn latest_run_for(&self, run_id: &str) -> Result<Option<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1
             ORDER BY created_at DESC, event_id DESC LIMIT 1"
        );
        let run = self
            .conn
            .query_row(&sql, params![run_id], run_from_row)
            .optional()
            .map_err(StoreError::from)?;
        Ok(run)
    }

    /// Filtered listing, ordered `created_at DESC, event_id` for a stable
    /// ordering within identical timestamps.
    pub fn query(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders: Vec<String> = filter
                .statuses
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", args.len() + i + 1))
                .collect();
            clauses.push(format!("status IN ({})", placeholders.join(", ")));
            for status in &filter.statuses {
                args.push(Box::new(status.as_str()));
            }
        }
        for (column, value) in [
            ("agent_name", &filter.agent_name),
            ("job_type", &filter.job_type),
            ("run_id", &filter.run_id),
            ("parent_run_id", &filter.parent_run_id),
        ] {
            if let Some(value) = value {
                args.push(Box::new(value.clone()));
                clauses.push(format!("{column} = ?{}", args.len()));
            }
        }

        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, event_id");
        // SQLite needs a LIMIT clause to carry an OFFSET; -1 means unbounded.
        match (filter.limit, filter.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        let mut stmt = self.conn.prepare(&sql).map_err(StoreError::from)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter().map(AsRef::as_ref)), run_from_row)
            .map_err(StoreError::from)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(StoreError::from)?);
        }
        Ok(runs)
    }

    /// Commit annotations attached to a run, newest first.
    pub fn commits_for(&self, event_id: &str) -> Result<Vec<CommitRef>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT commit_hash, run_event_id, message, author, committed_at
                 FROM commits WHERE run_event_id = ?1 ORDER BY committed_at DESC",
            )
            .map_err(StoreError::from)?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                let committed_at: Option<String> = row.get(4)?;
                Ok(CommitRef {
                    commit_hash: row.get(0)?,
                    run_event_id: row.get(1)?,
                    message: row.get(2)?,
                    author: row.get(3)?,
                    committed_at: committed_at.as_deref().map(parse_ts).transpose().map_err(
                        |e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e),
                    )?,
                })
            })
            .map_err(StoreError::from)?;
        let mut commits = Vec::new();
        for row in rows {
            commits.push(row.map_err(StoreError::from)?);
        }
        Ok(commits)
    }

    // -- delivery helpers ---------------------------------------------------

    /// Undelivered runs below the retry ceiling, oldest first.
    pub fn unposted_runs(&self, limit: usize, max_attempts: i64) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE api_posted = 0 AND api_retry_count < ?1
             ORDER BY created_at ASC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(StoreError::from)?;
        let rows = stmt
            .query_map(params![max_attempts, limit as i64], run_from_row)
            .map_err(StoreError::from)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(StoreError::from)?);
        }
        Ok(runs)
    }

    /// Mark a run delivered. Idempotent: the first delivery timestamp wins.
    pub fn mark_posted(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET api_posted = 1,
                    api_posted_at = COALESCE(api_posted_at, ?2),
                    updated_at = ?3
                 WHERE event_id = ?1",
                params![event_id, fmt_ts(&at), fmt_ts(&Utc::now())],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::NotFound(event_id.to_string()).into());
        }
        Ok(())
    }

    /// Increment the delivery retry counter, returning the new value.
    pub fn bump_retry(&self, event_id: &str) -> Result<i64> {
        let count = self
            .conn
            .query_row(
                "UPDATE runs SET api_retry_count = api_retry_count + 1, updated_at = ?2
                 WHERE event_id = ?1 RETURNING api_retry_count",
                params![event_id, fmt_ts(&Utc::now())],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        count.ok_or_else(|| StoreError::NotFound(event_id.to_string()).into())
    }

    // -- counts (recovery / diagnostics) ------------------------------------

    pub fn run_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM runs")
    }

    pub fn event_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM events")
    }

    fn scalar(&self, sql: &str) -> Result<i64> {
        let n = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .map_err(StoreError::from)?;
        Ok(n)
    }
}

/// Shared by `upsert_run` and `apply_record` (the latter inside its
/// transaction).
fn write_run(conn: &Connection, run: &Run) -> Result<()> {
    run.validate()?;
    conn.execute(
        "INSERT INTO runs (event_id, run_id, parent_run_id, agent_name, job_type,
            status, items_discovered, items_succeeded, items_failed, items_skipped,
            duration_secs, start_time, end_time, metrics, context,
            api_posted, api_posted_at, api_retry_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
         ON CONFLICT(event_id) DO UPDATE SET
            run_id = excluded.run_id,
            parent_run_id = excluded.parent_run_id,
            agent_name = excluded.agent_name,
            job_type = excluded.job_type,
            status = excluded.status,
            items_discovered = excluded.items_discovered,
            items_succeeded = excluded.items_succeeded,
            items_failed = excluded.items_failed,
            items_skipped = excluded.items_skipped,
            duration_secs = excluded.duration_secs,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            metrics = excluded.metrics,
            context = excluded.context,
            updated_at = excluded.updated_at",
        params![
            run.event_id,
            run.run_id,
            run.parent_run_id,
            run.agent_name,
            run.job_type,
            run.status.as_str(),
            run.items_discovered,
            run.items_succeeded,
            run.items_failed,
            run.items_skipped,
            run.duration_secs,
            fmt_ts(&run.start_time),
            run.end_time.as_ref().map(fmt_ts),
            run.metrics.as_ref().map(ToString::to_string),
            run.context.as_ref().map(ToString::to_string),
            i64::from(run.api_posted),
            run.api_posted_at.as_ref().map(fmt_ts),
            run.api_retry_count,
            fmt_ts(&run.created_at),
            fmt_ts(&run.updated_at),
        ],
    )
    .map_err(StoreError::from)?;
    Ok(())
}

/// Fold a patch into a run. `None` fields leave the stored value untouched;
/// counters are absolute.
pub(crate) fn apply_patch(run: &mut Run, patch: &RunPatch) {
    if let Some(status) = patch.status {
        run.status = status;
    }
    if let Some(v) = patch.items_discovered {
        run.items_discovered = v;
    }
    if let Some(v) = patch.items_succeeded {
        run.items_succeeded = v;
    }
    if let Some(v) = patch.items_failed {
        run.items_failed = v;
    }
    if let Some(v) = patch.items_skipped {
        run.items_skipped = v;
    }
    if let Some(v) = patch.duration_secs {
        run.duration_secs = Some(v);
    }
    if let Some(v) = patch.end_time {
        run.end_time = Some(v);
    }
    if patch.metrics.is_some() {
        run.metrics.clone_from(&patch.metrics);
    }
    if patch.context.is_some() {
        run.context.clone_from(&patch.context);
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// RFC 3339 with microseconds and a `Z` suffix; lexicographic order matches
/// chronological order.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, Box<dyn std::error::Error + Send + Sync>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    fn conv<T, E>(idx: usize, res: std::result::Result<T, E>) -> rusqlite::Result<T>
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        res.map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
        })
    }

    let status_raw: String = row.get(5)?;
    let status = conv(
        5,
        RunStatus::normalize(&status_raw)
            .ok_or_else(|| format!("non-canonical status in store: {status_raw}")),
    )?;
    let start_time: String = row.get(11)?;
    let end_time: Option<String> = row.get(12)?;
    let metrics: Option<String> = row.get(13)?;
    let context: Option<String> = row.get(14)?;
    let api_posted: i64 = row.get(15)?;
    let api_posted_at: Option<String> = row.get(16)?;
    let created_at: String = row.get(18)?;
    let updated_at: String = row.get(19)?;

    Ok(Run {
        event_id: row.get(0)?,
        run_id: row.get(1)?,
        parent_run_id: row.get(2)?,
        agent_name: row.get(3)?,
        job_type: row.get(4)?,
        status,
        items_discovered: row.get(6)?,
        items_succeeded: row.get(7)?,
        items_failed: row.get(8)?,
        items_skipped: row.get(9)?,
        duration_secs: row.get(10)?,
        start_time: conv(11, parse_ts(&start_time))?,
        end_time: end_time.as_deref().map(parse_ts).transpose().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, e)
        })?,
        metrics: metrics
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    13,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        context: context
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    14,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        api_posted: api_posted != 0,
        api_posted_at: api_posted_at.as_deref().map(parse_ts).transpose().map_err(
            |e| rusqlite::Error::FromSqlConversionFailure(16, rusqlite::types::Type::Text, e),
        )?,
        api_retry_count: row.get(17)?,
        created_at: conv(18, parse_ts(&created_at))?,
        updated_at: conv(19, parse_ts(&updated_at))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogPayload;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> RunStore {
        RunStore::open(dir.join("runs.db")).unwrap()
    }

    fn start_record(event_id: &str, run_id: &str, agent: &str, job: &str) -> LogRecord {
        LogRecord::new(
            event_id,
            run_id,
            LogPayload::Start {
                parent_run_id: None,
                agent_name: agent.to_string(),
                job_type: job.to_string(),
                start_time: Utc::now(),
                context: None,
            },
        )
    }

    fn end_record(event_id: &str, run_id: &str, status: RunStatus) -> LogRecord {
        LogRecord::new(
            event_id,
            run_id,
            LogPayload::End {
                patch: RunPatch {
                    status: Some(status),
                    end_time: Some(Utc::now()),
                    duration_secs: Some(2.5),
                    ..RunPatch::default()
                },
            },
        )
    }

    #[test]
    fn start_checkpoint_end_lifecycle() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        store
            .apply_record(&start_record("ev-1", "r1", "scraper", "crawl"))
            .unwrap();
        store
            .apply_record(&LogRecord::new(
                "ev-1",
                "r1",
                LogPayload::Checkpoint {
                    patch: RunPatch {
                        items_discovered: Some(100),
                        items_succeeded: Some(40),
                        ..RunPatch::default()
                    },
                },
            ))
            .unwrap();
        store
            .apply_record(&end_record("ev-1", "r1", RunStatus::Success))
            .unwrap();

        let run = store.get_run("ev-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.items_discovered, 100);
        assert_eq!(run.items_succeeded, 40);
        assert!(run.end_time.is_some());
        assert_eq!(store.event_count().unwrap(), 3);
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let start = start_record("ev-1", "r1", "a", "j");
        let end = end_record("ev-1", "r1", RunStatus::Partial);

        for _ in 0..3 {
            store.apply_record(&start).unwrap();
            store.apply_record(&end).unwrap();
        }

        let run = store.get_run("ev-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(store.run_count().unwrap(), 1);
        assert_eq!(store.event_count().unwrap(), 2);
    }

    #[test]
    fn duplicate_record_reports_already_applied() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let record = start_record("ev-1", "r1", "a", "j");
        assert!(store.apply_record(&record).unwrap());
        assert!(!store.apply_record(&record).unwrap());
    }

    #[test]
    fn duplicate_apply_leaves_the_row_byte_identical() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let record = start_record("ev-1", "r1", "a", "j");
        store.apply_record(&record).unwrap();
        let before = store.get_run("ev-1").unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!store.apply_record(&record).unwrap());
        let after = store.get_run("ev-1").unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[test]
    fn negative_counter_rejected_before_storage() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .apply_record(&start_record("ev-1", "r1", "a", "j"))
            .unwrap();

        let bad = LogRecord::new(
            "ev-1",
            "r1",
            LogPayload::Checkpoint {
                patch: RunPatch {
                    items_failed: Some(-1),
                    ..RunPatch::default()
                },
            },
        );
        let err = store.apply_record(&bad).unwrap_err();
        assert!(err.to_string().contains("items_failed"));
        // The event row was not written either.
        assert_eq!(store.event_count().unwrap(), 1);
    }

    #[test]
    fn get_run_absent_is_none() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(store.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn query_multi_status_or_and_dimension_and() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        store
            .apply_record(&start_record("ev-1", "r1", "scraper", "crawl"))
            .unwrap();
        store
            .apply_record(&end_record("ev-1", "r1", RunStatus::Success))
            .unwrap();
        store
            .apply_record(&start_record("ev-2", "r2", "scraper", "crawl"))
            .unwrap();
        store
            .apply_record(&end_record("ev-2", "r2", RunStatus::Failure))
            .unwrap();
        store
            .apply_record(&start_record("ev-3", "r3", "indexer", "crawl"))
            .unwrap();

        let filter = RunFilter {
            statuses: vec![RunStatus::Success, RunStatus::Failure],
            agent_name: Some("scraper".to_string()),
            ..RunFilter::default()
        };
        let runs = store.query(&filter).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.agent_name == "scraper"));

        let running_only = store
            .query(&RunFilter {
                statuses: vec![RunStatus::Running],
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(running_only.len(), 1);
        assert_eq!(running_only[0].event_id, "ev-3");
    }

    #[test]
    fn query_limit_and_offset() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        for i in 0..5 {
            store
                .apply_record(&start_record(&format!("ev-{i}"), &format!("r-{i}"), "a", "j"))
                .unwrap();
        }
        let page = store
            .query(&RunFilter {
                limit: Some(2),
                offset: Some(2),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);

        // Offset alone still paginates.
        let tail = store
            .query(&RunFilter {
                offset: Some(2),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(tail.len(), 3);

        let all = store.query(&RunFilter::default()).unwrap();
        assert_eq!(all[2..], tail[..]);
    }

    #[test]
    fn latest_run_for_lineage() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .apply_record(&start_record("ev-old", "shared", "a", "j"))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .apply_record(&start_record("ev-new", "shared", "a", "j"))
            .unwrap();

        let latest = store.latest_run_for("shared").unwrap().unwrap();
        assert_eq!(latest.event_id, "ev-new");
    }

    #[test]
    fn delivery_helpers() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .apply_record(&start_record("ev-1", "r1", "a", "j"))
            .unwrap();
        store
            .apply_record(&start_record("ev-2", "r2", "a", "j"))
            .unwrap();

        let unposted = store.unposted_runs(10, 10).unwrap();
        assert_eq!(unposted.len(), 2);

        store.mark_posted("ev-1", Utc::now()).unwrap();
        let unposted = store.unposted_runs(10, 10).unwrap();
        assert_eq!(unposted.len(), 1);
        assert_eq!(unposted[0].event_id, "ev-2");

        // Idempotent: re-marking keeps the first timestamp.
        let first = store.get_run("ev-1").unwrap().unwrap().api_posted_at;
        store.mark_posted("ev-1", Utc::now()).unwrap();
        assert_eq!(store.get_run("ev-1").unwrap().unwrap().api_posted_at, first);

        assert_eq!(store.bump_retry("ev-2").unwrap(), 1);
        assert_eq!(store.bump_retry("ev-2").unwrap(), 2);

        // Retry ceiling excludes the run from the scan.
        let capped = store.unposted_runs(10, 2).unwrap();
        assert!(capped.is_empty());
    }

    #[test]
    fn commit_records_attach_to_runs() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .apply_record(&start_record("ev-1", "r1", "a", "j"))
            .unwrap();
        let commit = LogRecord::new(
            "ev-1",
            "r1",
            LogPayload::Commit {
                commit_hash: "abc123".to_string(),
                message: Some("ingest new feed".to_string()),
                author: Some("dev".to_string()),
            },
        );
        store.apply_record(&commit).unwrap();
        store.apply_record(&commit).unwrap();

        let commits = store.commits_for("ev-1").unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit_hash, "abc123");
    }

    #[test]
    fn migrations_record_versions() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let version: i64 = store
            .connection()
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);

        // Reopening does not re-apply.
        drop(store);
        let store = open_store(dir.path());
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
