//! Write facade: the only writer, and the never-crash boundary.
//!
//! Every public operation appends to the log first, then folds the record
//! into the indexed store, and reports what happened through a [`Receipt`].
//! Nothing here returns `Err` or panics: a broken store or disk degrades
//! writes to the side-channel counters and `tracing` warnings, never to the
//! instrumented caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::applog::AppendLog;
use crate::config::LedgerConfig;
use crate::error::Result;
use crate::model::{LogPayload, LogRecord, RunPatch};
use crate::status::RunStatus;
use crate::store::RunStore;
use crate::telemetry::Counters;

/// What happened to a single write. Never an error: inspect the flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Identity of the run the write targeted.
    pub event_id: String,
    /// The record reached the durable append log.
    pub log_appended: bool,
    /// The record was folded into the indexed store.
    pub indexed: bool,
    /// Set when the write was rejected at the validation boundary; the
    /// record touched neither log nor store.
    pub rejection: Option<String>,
}

impl Receipt {
    fn rejected(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            log_appended: false,
            indexed: false,
            rejection: Some(reason.into()),
        }
    }

    /// True when the write is durable (the log has it); the index may lag.
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.log_appended
    }
}

/// Fields accepted when opening a run.
#[derive(Debug, Clone, Default)]
pub struct StartRun {
    /// Caller-supplied identity; generated (UUID v4) when absent.
    pub event_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub agent_name: String,
    pub job_type: String,
    /// Defaults to now.
    pub start_time: Option<DateTime<Utc>>,
    pub context: Option<serde_json::Value>,
}

/// The single writer for the store pair.
pub struct RunRecorder {
    log: AppendLog,
    store: Mutex<RunStore>,
    counters: Arc<Counters>,
    /// run_id -> event_id for runs started by this process.
    active: Mutex<HashMap<String, String>>,
}

impl RunRecorder {
    /// Open the log and store described by `config`.
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let log = AppendLog::open(
            config.append_log_path(),
            config.lock_path(),
            config.lock_timeout(),
        )?;
        let store = RunStore::open(config.db_path())?;
        Ok(Self::from_parts(log, store, Arc::new(Counters::new())))
    }

    #[must_use]
    pub fn from_parts(log: AppendLog, store: RunStore, counters: Arc<Counters>) -> Self {
        Self {
            log,
            store: Mutex::new(store),
            counters,
            active: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    // -- agent surface (keyed by run_id) ------------------------------------

    /// Open a run. Returns the receipt carrying the assigned `event_id`;
    /// subsequent `checkpoint`/`end_run` calls resolve it by `run_id`.
    pub fn start_run(&self, run_id: &str, start: StartRun) -> Receipt {
        if run_id.trim().is_empty() {
            self.counters.incr_write_rejections();
            return Receipt::rejected("", "run_id must not be empty");
        }
        if start.agent_name.trim().is_empty() || start.job_type.trim().is_empty() {
            self.counters.incr_write_rejections();
            return Receipt::rejected("", "agent_name and job_type are required");
        }

        let event_id = start
            .event_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = LogRecord::new(
            &event_id,
            run_id,
            LogPayload::Start {
                parent_run_id: start.parent_run_id,
                agent_name: start.agent_name,
                job_type: start.job_type,
                start_time: start.start_time.unwrap_or_else(Utc::now),
                context: start.context,
            },
        );
        let receipt = self.record(record);
        if receipt.accepted() {
            if let Ok(mut active) = self.active.lock() {
                active.insert(run_id.to_string(), event_id);
            }
        }
        receipt
    }

    /// Mid-run progress update; counters in the patch are absolute.
    pub fn checkpoint(&self, run_id: &str, patch: RunPatch) -> Receipt {
        let Some(event_id) = self.resolve(run_id) else {
            self.counters.incr_write_rejections();
            return Receipt::rejected("", format!("no run found for run_id {run_id}"));
        };
        if let Err(e) = patch.validate() {
            self.counters.incr_write_rejections();
            return Receipt::rejected(event_id, e.to_string());
        }
        self.record(LogRecord::new(
            event_id,
            run_id,
            LogPayload::Checkpoint { patch },
        ))
    }

    /// Close a run. `patch.status` defaults to `Success` and must be
    /// terminal; `patch.end_time` defaults to now.
    pub fn end_run(&self, run_id: &str, mut patch: RunPatch) -> Receipt {
        let Some(event_id) = self.resolve(run_id) else {
            self.counters.incr_write_rejections();
            return Receipt::rejected("", format!("no run found for run_id {run_id}"));
        };
        let status = patch.status.unwrap_or(RunStatus::Success);
        if !status.is_terminal() {
            self.counters.incr_write_rejections();
            return Receipt::rejected(event_id, format!("end_run requires a terminal status, got {status}"));
        }
        patch.status = Some(status);
        if patch.end_time.is_none() {
            patch.end_time = Some(Utc::now());
        }
        if let Err(e) = patch.validate() {
            self.counters.incr_write_rejections();
            return Receipt::rejected(event_id, e.to_string());
        }
        let receipt = self.record(LogRecord::new(&event_id, run_id, LogPayload::End { patch }));
        if receipt.accepted() {
            if let Ok(mut active) = self.active.lock() {
                active.remove(run_id);
            }
        }
        receipt
    }

    /// Attach a version-control commit to a run.
    pub fn record_commit(
        &self,
        run_id: &str,
        commit_hash: &str,
        message: Option<String>,
        author: Option<String>,
    ) -> Receipt {
        let Some(event_id) = self.resolve(run_id) else {
            self.counters.incr_write_rejections();
            return Receipt::rejected("", format!("no run found for run_id {run_id}"));
        };
        if commit_hash.trim().is_empty() {
            self.counters.incr_write_rejections();
            return Receipt::rejected(event_id, "commit_hash must not be empty");
        }
        self.record(LogRecord::new(
            event_id,
            run_id,
            LogPayload::Commit {
                commit_hash: commit_hash.to_string(),
                message,
                author,
            },
        ))
    }

    // -- ingest surface (keyed by event_id) ---------------------------------

    /// Create a run from an externally supplied record.
    ///
    /// Idempotent on `event_id`: re-posting an already known run appends
    /// nothing and reports success.
    pub fn ingest_run(&self, run_id: &str, event_id: &str, start: StartRun, patch: RunPatch) -> Receipt {
        if event_id.trim().is_empty() {
            self.counters.incr_write_rejections();
            return Receipt::rejected("", "event_id must not be empty");
        }
        match self.with_store(|store| store.get_run(event_id)) {
            Ok(Some(_)) => {
                return Receipt {
                    event_id: event_id.to_string(),
                    log_appended: false,
                    indexed: true,
                    rejection: None,
                };
            }
            Ok(None) => {}
            Err(e) => {
                // Store unreadable; fall through and let the log decide.
                warn!(event_id, error = %e, "dedupe lookup failed during ingest");
            }
        }

        let started = self.start_run(
            run_id,
            StartRun {
                event_id: Some(event_id.to_string()),
                ..start
            },
        );
        if !started.accepted() || patch.is_empty() {
            return started;
        }
        // Terminal or progress state supplied with the creation.
        let payload = if patch.status.is_some_and(RunStatus::is_terminal) {
            LogPayload::End { patch }
        } else {
            LogPayload::Checkpoint { patch }
        };
        self.record(LogRecord::new(event_id, run_id, payload))
    }

    /// Partial update of a known run, keyed by `event_id`.
    pub fn patch_run(&self, event_id: &str, patch: RunPatch) -> Receipt {
        if patch.is_empty() {
            self.counters.incr_write_rejections();
            return Receipt::rejected(event_id, "empty patch");
        }
        if let Err(e) = patch.validate() {
            self.counters.incr_write_rejections();
            return Receipt::rejected(event_id, e.to_string());
        }
        let run_id = match self.with_store(|store| store.get_run(event_id)) {
            Ok(Some(run)) => run.run_id,
            Ok(None) => {
                self.counters.incr_write_rejections();
                return Receipt::rejected(event_id, format!("unknown event_id {event_id}"));
            }
            Err(e) => {
                self.counters.incr_write_rejections();
                return Receipt::rejected(event_id, e.to_string());
            }
        };
        let payload = if patch.status.is_some_and(RunStatus::is_terminal) {
            LogPayload::End { patch }
        } else {
            LogPayload::Checkpoint { patch }
        };
        self.record(LogRecord::new(event_id, run_id, payload))
    }

    // -- internals ----------------------------------------------------------

    /// Append-then-index. The log is ground truth: an index failure after a
    /// successful append still counts as an accepted write, but a record
    /// that never reached the log must not become queryable — the store
    /// holds only state a rebuild from the log would reproduce.
    fn record(&self, record: LogRecord) -> Receipt {
        let event_id = record.event_id.clone();

        match self.log.append(&record) {
            Ok(()) => self.counters.incr_writes(),
            Err(e) => {
                self.counters.incr_log_failures();
                warn!(event_id = %event_id, error = %e, "append log write failed");
                return Receipt {
                    event_id,
                    log_appended: false,
                    indexed: false,
                    rejection: None,
                };
            }
        }

        let indexed = match self.with_store(|store| store.apply_record(&record)) {
            Ok(_) => true,
            Err(e) => {
                self.counters.incr_index_failures();
                warn!(event_id = %event_id, error = %e, "indexed store apply failed");
                false
            }
        };

        Receipt {
            event_id,
            log_appended: true,
            indexed,
            rejection: None,
        }
    }

    /// Resolve a lineage `run_id` to its current `event_id`: the in-memory
    /// map for runs this process started, the store for everything else.
    fn resolve(&self, run_id: &str) -> Option<String> {
        if let Ok(active) = self.active.lock() {
            if let Some(event_id) = active.get(run_id) {
                return Some(event_id.clone());
            }
        }
        match self.with_store(|store| store.latest_run_for(run_id)) {
            Ok(Some(run)) => {
                if let Ok(mut active) = self.active.lock() {
                    active.insert(run_id.to_string(), run.event_id.clone());
                }
                Some(run.event_id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(run_id, error = %e, "run_id lookup failed");
                None
            }
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut RunStore) -> Result<T>) -> Result<T> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| crate::error::StoreError::Database("store mutex poisoned".into()))?;
        f(&mut store)
    }
}

impl std::fmt::Debug for RunRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRecorder")
            .field("log", &self.log.path())
            .finish_non_exhaustive()
    }
}
