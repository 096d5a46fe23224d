//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{
    CursorStatus, Resource, ResourceKind, RunSummary, SyncCursor, SyncRun, TokenRecord,
    UnroutedNotification, UpsertOutcome, UserId, WebhookLogEntry, WebhookStats,
};

/// Token fields written by an exchange or a renewal
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

/// Cursor fields written once a run has been finalized
#[derive(Debug, Clone, PartialEq)]
pub struct CursorAdvance {
    pub status: CursorStatus,
    pub last_sync_at: DateTime<Utc>,
    /// `None` leaves the stored value untouched
    pub last_successful_sync: Option<DateTime<Utc>>,
}

/// Persistence for the sync control plane
///
/// Every method is one short transaction scoped to a single logical step;
/// no implementation holds a lock across calls, so callers may interleave
/// network round-trips freely.
pub trait MarketStore: Send + Sync {
    // === Tokens ===

    /// Get the credential record for a seller
    fn get_token(&self, user_id: &UserId) -> Result<Option<TokenRecord>>;

    /// List every credential record
    fn list_tokens(&self) -> Result<Vec<TokenRecord>>;

    /// Insert or overwrite the token fields for a seller.
    ///
    /// Creates the record on first exchange. On update only the token
    /// fields change; `needs_reauth`, `last_reauth_attempt`,
    /// `last_sync_attempt` and `created_at` are preserved.
    fn store_issued_token(&self, token: &IssuedToken) -> Result<()>;

    /// Flag the seller's refresh token as rejected
    fn mark_needs_reauth(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()>;

    /// Clear `needs_reauth` after the gap has been backfilled
    fn complete_reauth_gap(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()>;

    // === Cursors ===

    /// Create the cursor if absent; existing cursors are left untouched
    fn ensure_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    fn get_cursor(&self, user_id: &UserId, kind: ResourceKind) -> Result<Option<SyncCursor>>;

    fn list_cursors(&self) -> Result<Vec<SyncCursor>>;

    /// Record a run's effect on the cursor
    fn advance_cursor(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        advance: &CursorAdvance,
    ) -> Result<()>;

    /// Pause or resume scheduling for one cursor; returns false if absent
    fn set_cursor_active(&self, user_id: &UserId, kind: ResourceKind, active: bool)
    -> Result<bool>;

    // === Sync runs ===

    /// Append a `running` run and return its id
    fn start_sync_run(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        started_at: DateTime<Utc>,
    ) -> Result<i64>;

    /// Finalize a run. Returns false when the run was already finalized,
    /// in which case nothing is written.
    fn finish_sync_run(&self, run_id: i64, summary: &RunSummary) -> Result<bool>;

    fn get_sync_run(&self, run_id: i64) -> Result<Option<SyncRun>>;

    /// Most recent runs first
    fn list_sync_runs(
        &self,
        user_id: &UserId,
        kind: Option<ResourceKind>,
        limit: usize,
    ) -> Result<Vec<SyncRun>>;

    /// Finalize runs still `running` that started before `before` as
    /// `error` with `message`, completed at `before`. Returns how many were
    /// closed.
    fn fail_stale_runs(&self, before: DateTime<Utc>, message: &str) -> Result<usize>;

    // === Resources ===

    /// Insert or replace a mirrored resource, atomically
    fn upsert_resource(&self, resource: &Resource) -> Result<UpsertOutcome>;

    fn get_resource(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        external_id: &str,
    ) -> Result<Option<Resource>>;

    fn count_resources(&self, user_id: &UserId, kind: ResourceKind) -> Result<usize>;

    // === Webhooks ===

    /// Append a log entry and fold it into the `(user, topic)` stats, in
    /// one transaction
    fn record_webhook(&self, entry: &WebhookLogEntry) -> Result<()>;

    /// Most recent entries first, optionally for one seller
    fn list_webhook_logs(
        &self,
        user_id: Option<&UserId>,
        limit: usize,
    ) -> Result<Vec<WebhookLogEntry>>;

    fn webhook_stats(&self, user_id: &UserId) -> Result<Vec<WebhookStats>>;

    /// Delete log entries processed before `before`; stats are kept
    fn prune_webhook_logs(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Persist a notification without a dedicated handler, upserted by id
    fn store_unrouted(&self, notification: &UnroutedNotification) -> Result<()>;

    fn list_unrouted(&self, limit: usize) -> Result<Vec<UnroutedNotification>>;
}
