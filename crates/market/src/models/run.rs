//! Append-only audit trail of sync runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ResourceKind, UpsertOutcome, UserId};

/// Lifecycle state of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "error" => Some(RunStatus::Error),
            "partial" => Some(RunStatus::Partial),
            _ => None,
        }
    }

    /// Final status of a run from its item counters.
    ///
    /// A fatal (non-item) failure always yields `Error` so the cursor stays
    /// put and the next run re-walks the same window. Otherwise: no item
    /// errors is `Success`, some is `Partial`, all is `Error`.
    pub fn classify(counters: &RunCounters, fatal: bool) -> Self {
        if fatal {
            return RunStatus::Error;
        }
        match counters.errors {
            0 => RunStatus::Success,
            e if e < counters.processed => RunStatus::Partial,
            _ => RunStatus::Error,
        }
    }
}

/// Item counters accumulated during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: u32,
    pub created: u32,
    pub updated: u32,
    pub errors: u32,
}

impl RunCounters {
    pub fn record_upsert(&mut self, outcome: UpsertOutcome) {
        self.processed += 1;
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    pub fn record_error(&mut self) {
        self.processed += 1;
        self.errors += 1;
    }
}

/// Values written once when a run is finalized
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub status: RunStatus,
    pub counters: RunCounters,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

/// One sync run as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub user_id: UserId,
    pub kind: ResourceKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}
