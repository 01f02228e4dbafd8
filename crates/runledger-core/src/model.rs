//! Data model: runs, log records, and partial updates.
//!
//! A `Run` row is the fold of its `LogRecord`s plus store-assigned
//! timestamps. Checkpoint counters are absolute values, not increments, so
//! replaying the same record any number of times produces the same row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::status::RunStatus;

/// One tracked execution of an agent job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Globally unique identity, assigned at creation, immutable.
    pub event_id: String,
    /// Lineage identifier; may be shared by related runs.
    pub run_id: String,
    /// Optional parent in the run tree.
    pub parent_run_id: Option<String>,
    pub agent_name: String,
    pub job_type: String,
    pub status: RunStatus,
    pub items_discovered: i64,
    pub items_succeeded: i64,
    pub items_failed: i64,
    pub items_skipped: i64,
    /// Wall-clock duration in seconds, if reported.
    pub duration_secs: Option<f64>,
    pub start_time: DateTime<Utc>,
    /// Present only once the run reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Opaque structured payloads, not interpreted by the core.
    pub metrics: Option<serde_json::Value>,
    pub context: Option<serde_json::Value>,
    pub api_posted: bool,
    pub api_posted_at: Option<DateTime<Utc>>,
    pub api_retry_count: i64,
    /// Store-assigned.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// New run in the `Running` state with zeroed counters.
    #[must_use]
    pub fn new(event_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            event_id: event_id.into(),
            run_id: run_id.into(),
            parent_run_id: None,
            agent_name: String::new(),
            job_type: String::new(),
            status: RunStatus::Running,
            items_discovered: 0,
            items_succeeded: 0,
            items_failed: 0,
            items_skipped: 0,
            duration_secs: None,
            start_time: now,
            end_time: None,
            metrics: None,
            context: None,
            api_posted: false,
            api_posted_at: None,
            api_retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reject any state that would violate a store invariant.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.event_id.trim().is_empty() {
            return Err(StoreError::Validation("event_id must not be empty".into()));
        }
        if self.run_id.trim().is_empty() {
            return Err(StoreError::Validation("run_id must not be empty".into()));
        }
        validate_counters(
            self.items_discovered,
            self.items_succeeded,
            self.items_failed,
            self.items_skipped,
            self.duration_secs,
        )?;
        if self.api_retry_count < 0 {
            return Err(StoreError::Validation(
                "api_retry_count must be >= 0".into(),
            ));
        }
        if self.end_time.is_some() && !self.status.is_terminal() {
            return Err(StoreError::Validation(
                "end_time requires a terminal status".into(),
            ));
        }
        Ok(())
    }
}

fn validate_counters(
    discovered: i64,
    succeeded: i64,
    failed: i64,
    skipped: i64,
    duration_secs: Option<f64>,
) -> Result<(), StoreError> {
    for (name, value) in [
        ("items_discovered", discovered),
        ("items_succeeded", succeeded),
        ("items_failed", failed),
        ("items_skipped", skipped),
    ] {
        if value < 0 {
            return Err(StoreError::Validation(format!("{name} must be >= 0, got {value}")));
        }
    }
    if let Some(d) = duration_secs {
        if !d.is_finite() || d < 0.0 {
            return Err(StoreError::Validation(format!(
                "duration_secs must be a non-negative number, got {d}"
            )));
        }
    }
    Ok(())
}

/// Partial update of a run's mutable fields.
///
/// `None` leaves the stored value untouched; counters are absolute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub items_discovered: Option<i64>,
    pub items_succeeded: Option<i64>,
    pub items_failed: Option<i64>,
    pub items_skipped: Option<i64>,
    pub duration_secs: Option<f64>,
    pub end_time: Option<DateTime<Utc>>,
    pub metrics: Option<serde_json::Value>,
    pub context: Option<serde_json::Value>,
}

impl RunPatch {
    /// True when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        validate_counters(
            self.items_discovered.unwrap_or(0),
            self.items_succeeded.unwrap_or(0),
            self.items_failed.unwrap_or(0),
            self.items_skipped.unwrap_or(0),
            self.duration_secs,
        )?;
        if self.end_time.is_some() && !self.status.is_some_and(RunStatus::is_terminal) {
            return Err(StoreError::Validation(
                "end_time requires a terminal status".into(),
            ));
        }
        Ok(())
    }
}

/// Version-control commit annotation attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub commit_hash: String,
    /// Owning run's `event_id`.
    pub run_event_id: String,
    pub message: Option<String>,
    pub author: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// Event kinds that flow through the append log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStart,
    Checkpoint,
    RunEnd,
    Commit,
}

impl RunEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStart => "run_start",
            Self::Checkpoint => "checkpoint",
            Self::RunEnd => "run_end",
            Self::Commit => "commit",
        }
    }
}

/// Payload of a single append-log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogPayload {
    /// First write for an `event_id`: the full initial run state.
    Start {
        parent_run_id: Option<String>,
        agent_name: String,
        job_type: String,
        start_time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<serde_json::Value>,
    },
    /// Mid-run progress update; counters are absolute.
    Checkpoint { patch: RunPatch },
    /// Terminal update; `patch.status` carries the final status.
    End { patch: RunPatch },
    /// Version-control annotation.
    Commit {
        commit_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<String>,
    },
}

impl LogPayload {
    #[must_use]
    pub const fn event_type(&self) -> RunEventType {
        match self {
            Self::Start { .. } => RunEventType::RunStart,
            Self::Checkpoint { .. } => RunEventType::Checkpoint,
            Self::End { .. } => RunEventType::RunEnd,
            Self::Commit { .. } => RunEventType::Commit,
        }
    }
}

/// One self-contained, independently parseable append-log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unique identity of this record; makes replay idempotent.
    pub record_uid: String,
    /// Owning run's `event_id`.
    pub event_id: String,
    /// Lineage identifier.
    pub run_id: String,
    pub ts: DateTime<Utc>,
    pub payload: LogPayload,
}

impl LogRecord {
    #[must_use]
    pub fn new(event_id: impl Into<String>, run_id: impl Into<String>, payload: LogPayload) -> Self {
        Self {
            record_uid: uuid::Uuid::new_v4().to_string(),
            event_id: event_id.into(),
            run_id: run_id.into(),
            ts: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub fn event_type(&self) -> RunEventType {
        self.payload.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_is_valid() {
        let run = Run::new("ev-1", "r1");
        assert!(run.validate().is_ok());
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.end_time.is_none());
    }

    #[test]
    fn negative_counter_is_rejected() {
        let mut run = Run::new("ev-1", "r1");
        run.items_failed = -3;
        let err = run.validate().unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(err.to_string().contains("items_failed"));
    }

    #[test]
    fn end_time_requires_terminal_status() {
        let mut run = Run::new("ev-1", "r1");
        run.end_time = Some(Utc::now());
        assert!(run.validate().is_err());

        run.status = RunStatus::Success;
        assert!(run.validate().is_ok());
    }

    #[test]
    fn patch_validates_counters_and_duration() {
        let patch = RunPatch {
            items_succeeded: Some(-1),
            ..RunPatch::default()
        };
        assert!(patch.validate().is_err());

        let patch = RunPatch {
            duration_secs: Some(f64::NAN),
            ..RunPatch::default()
        };
        assert!(patch.validate().is_err());

        let patch = RunPatch {
            items_succeeded: Some(5),
            duration_secs: Some(1.25),
            ..RunPatch::default()
        };
        assert!(patch.validate().is_ok());
    }

    #[test]
    fn log_record_serializes_with_tagged_payload() {
        let record = LogRecord::new(
            "ev-1",
            "r1",
            LogPayload::Checkpoint {
                patch: RunPatch {
                    items_succeeded: Some(5),
                    ..RunPatch::default()
                },
            },
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"type\":\"checkpoint\""));
        let back: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.event_type(), RunEventType::Checkpoint);
    }

    #[test]
    fn duration_survives_json_round_trip_exactly() {
        // A value known to shift by 1 ulp under approximate float parsing.
        let duration = 97630.139_099_693_97_f64;
        let record = LogRecord::new(
            "ev-1",
            "r1",
            LogPayload::End {
                patch: RunPatch {
                    status: Some(RunStatus::Success),
                    duration_secs: Some(duration),
                    ..RunPatch::default()
                },
            },
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: LogRecord = serde_json::from_str(&json).unwrap();
        let LogPayload::End { patch } = back.payload else {
            panic!("payload type changed in round trip");
        };
        assert_eq!(patch.duration_secs, Some(duration));
    }

    #[test]
    fn record_uids_are_unique() {
        let a = LogRecord::new("e", "r", LogPayload::Checkpoint { patch: RunPatch::default() });
        let b = LogRecord::new("e", "r", LogPayload::Checkpoint { patch: RunPatch::default() });
        assert_ne!(a.record_uid, b.record_uid);
    }
}
