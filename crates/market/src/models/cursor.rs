//! Per-seller, per-kind incremental sync cursor

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ResourceKind, RunStatus, UserId};

/// Outcome recorded on a cursor after its most recent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStatus {
    NeverRun,
    Success,
    Error,
    Partial,
}

impl CursorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorStatus::NeverRun => "never_run",
            CursorStatus::Success => "success",
            CursorStatus::Error => "error",
            CursorStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never_run" => Some(CursorStatus::NeverRun),
            "success" => Some(CursorStatus::Success),
            "error" => Some(CursorStatus::Error),
            "partial" => Some(CursorStatus::Partial),
            _ => None,
        }
    }
}

impl From<RunStatus> for CursorStatus {
    /// Only terminal run states reach a cursor; `Running` never does.
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Success => CursorStatus::Success,
            RunStatus::Partial => CursorStatus::Partial,
            RunStatus::Running | RunStatus::Error => CursorStatus::Error,
        }
    }
}

/// How far one `(user, kind)` pair has been synchronized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub user_id: UserId,
    pub kind: ResourceKind,
    /// Completion time of the last run, whatever its outcome
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Window end of the last run that did not end in `error`
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub status: CursorStatus,
    pub frequency_minutes: u32,
    pub active: bool,
}

impl SyncCursor {
    /// Cursor created at onboarding, before any run
    pub fn new(user_id: UserId, kind: ResourceKind, frequency_minutes: u32) -> Self {
        Self {
            user_id,
            kind,
            last_sync_at: None,
            last_successful_sync: None,
            status: CursorStatus::NeverRun,
            frequency_minutes,
            active: true,
        }
    }

    /// Whether a run is due at `now`.
    ///
    /// Pure: `never_run`, or at least `frequency_minutes` since the last run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status == CursorStatus::NeverRun {
            return true;
        }
        match self.last_sync_at {
            Some(last) => now >= last + Duration::minutes(i64::from(self.frequency_minutes)),
            None => true,
        }
    }

    /// Start of the fetch window for the next run
    pub fn window_start(&self, lookback: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        self.last_successful_sync.unwrap_or(now - lookback)
    }

    /// Cursor after a run that covered changes up to `window_end` and
    /// completed at `completed_at`.
    ///
    /// `last_sync_at` always moves; `last_successful_sync` only moves when
    /// the run did not end in `error`.
    pub fn advanced(
        mut self,
        status: RunStatus,
        window_end: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        self.last_sync_at = Some(completed_at);
        self.status = CursorStatus::from(status);
        if self.status != CursorStatus::Error {
            self.last_successful_sync = Some(window_end);
        }
        self
    }
}
