//! Canonical run status and the single alias-normalization table.
//!
//! Every ingress point (write facade, HTTP create/patch, query filters)
//! resolves caller-supplied status strings through [`RunStatus::normalize`]
//! so no code path can store or match a non-canonical spelling.

use serde::{Deserialize, Serialize};

/// The closed set of lifecycle states a run may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
    Partial,
    Timeout,
    Cancelled,
}

impl RunStatus {
    /// All canonical members, in declaration order.
    pub const ALL: [RunStatus; 6] = [
        Self::Running,
        Self::Success,
        Self::Failure,
        Self::Partial,
        Self::Timeout,
        Self::Cancelled,
    ];

    /// Canonical storage spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Partial => "partial",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Resolve a caller-supplied spelling to a canonical member.
    ///
    /// Accepts the canonical names plus the legacy aliases observed at the
    /// boundary. Matching is case-insensitive. Returns `None` for anything
    /// outside the table; callers must treat that as a validation failure,
    /// never store the input verbatim.
    #[must_use]
    pub fn normalize(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        let status = match lowered.as_str() {
            "running" | "started" | "in_progress" | "active" => Self::Running,
            "success" | "succeeded" | "completed" | "complete" | "ok" | "passed" => Self::Success,
            "failure" | "failed" | "error" | "errored" | "crashed" => Self::Failure,
            "partial" | "partial_success" | "incomplete" => Self::Partial,
            "timeout" | "timed_out" => Self::Timeout,
            "cancelled" | "canceled" | "aborted" => Self::Cancelled,
            _ => return None,
        };
        Some(status)
    }

    /// True once a run has reached this status and may carry an `end_time`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| format!("unrecognized run status: {s}"))
    }
}
