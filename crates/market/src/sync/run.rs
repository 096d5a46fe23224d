//! One incremental sync run for a `(user, kind)` pair

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use super::walk::ChangeWalk;
use crate::config::SyncSettings;
use crate::models::{ResourceKind, RunCounters, RunStatus, RunSummary, SyncCursor, UserId};
use crate::remote::{MarketplaceApi, RetryPolicy};
use crate::storage::{CursorAdvance, MarketStore};
use crate::tokens::TokenRefresher;

/// What a run did
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub user_id: UserId,
    pub kind: ResourceKind,
    /// `None` only when the run could not even be recorded
    pub run_id: Option<i64>,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub window_start: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Runs the fetch-window / page / upsert / finalize cycle
pub struct ResourceSyncer {
    refresher: Arc<TokenRefresher>,
    api: Arc<dyn MarketplaceApi>,
    settings: SyncSettings,
}

impl ResourceSyncer {
    pub fn new(
        refresher: Arc<TokenRefresher>,
        api: Arc<dyn MarketplaceApi>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            refresher,
            api,
            settings,
        }
    }

    /// Sync one `(user, kind)` pair.
    ///
    /// Never fails: every error ends up in the run's status and message.
    /// The cursor is written last, so a run cut short leaves it untouched
    /// and the next run re-walks the same window.
    pub fn run(&self, user_id: &UserId, kind: ResourceKind) -> RunOutcome {
        let store = self.refresher.store();
        let clock = self.refresher.clock();
        let started = Instant::now();
        let started_at = clock.now();

        let mut outcome = RunOutcome {
            user_id: user_id.clone(),
            kind,
            run_id: None,
            status: RunStatus::Error,
            counters: RunCounters::default(),
            window_start: None,
            error_message: None,
        };

        let (cursor, run_id) = match self.begin(user_id, kind, started_at) {
            Ok(begun) => begun,
            Err(e) => {
                log::error!(
                    "[SYNC] Could not start {} run for user {}: {:#}",
                    kind,
                    user_id,
                    e
                );
                outcome.error_message = Some(format!("{:#}", e));
                return outcome;
            }
        };
        outcome.run_id = Some(run_id);

        let window_start = cursor.window_start(self.settings.lookback_for(kind), started_at);
        outcome.window_start = Some(window_start);

        log::info!(
            "[SYNC] Run {} for user {} {} since {}",
            run_id,
            user_id,
            kind,
            window_start
        );

        let fatal = self
            .walk(user_id, kind, window_start, &mut outcome.counters)
            .err();

        outcome.status = RunStatus::classify(&outcome.counters, fatal.is_some());
        outcome.error_message = fatal;

        let completed_at = clock.now();
        let summary = RunSummary {
            status: outcome.status,
            counters: outcome.counters,
            completed_at,
            duration_ms: started.elapsed().as_millis() as i64,
            error_message: outcome.error_message.clone(),
        };

        match store.finish_sync_run(run_id, &summary) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "[SYNC] Run {} was already finalized elsewhere; cursor left as is",
                    run_id
                );
                return outcome;
            }
            Err(e) => {
                log::error!("[SYNC] Failed to finalize run {}: {:#}", run_id, e);
                return outcome;
            }
        }

        let next = cursor.advanced(outcome.status, started_at, completed_at);
        let advance = CursorAdvance {
            status: next.status,
            last_sync_at: completed_at,
            last_successful_sync: next.last_successful_sync,
        };
        if let Err(e) = store.advance_cursor(user_id, kind, &advance) {
            log::error!(
                "[SYNC] Failed to advance {} cursor for user {}: {:#}",
                kind,
                user_id,
                e
            );
        }

        let counters = &outcome.counters;
        match outcome.status {
            RunStatus::Success => log::info!(
                "[SYNC] Run {} succeeded: {} processed, {} created, {} updated",
                run_id,
                counters.processed,
                counters.created,
                counters.updated
            ),
            RunStatus::Partial => log::warn!(
                "[SYNC] Run {} partial: {} of {} items failed",
                run_id,
                counters.errors,
                counters.processed
            ),
            RunStatus::Error | RunStatus::Running => log::error!(
                "[SYNC] Run {} failed after {} items: {}",
                run_id,
                counters.processed,
                outcome.error_message.as_deref().unwrap_or("every item failed")
            ),
        }

        outcome
    }

    /// Ensure the cursor exists, read it, and open the run record
    fn begin(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<(SyncCursor, i64)> {
        let store = self.refresher.store();
        let fresh = SyncCursor::new(
            user_id.clone(),
            kind,
            self.settings.default_frequency_minutes,
        );
        store.ensure_cursor(&fresh)?;
        let cursor = store.get_cursor(user_id, kind)?.unwrap_or(fresh);
        let run_id = store.start_sync_run(user_id, kind, started_at)?;
        Ok((cursor, run_id))
    }

    /// Walk the window; `Err` carries the message of a fatal failure
    fn walk(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        since: DateTime<Utc>,
        counters: &mut RunCounters,
    ) -> Result<(), String> {
        let access_token = self
            .refresher
            .access_token(user_id)
            .map_err(|e| e.to_string())?;

        ChangeWalk {
            api: self.api.as_ref(),
            store: self.refresher.store().as_ref(),
            access_token: &access_token,
            user_id,
            kind,
            since,
            page_size: self.settings.page_size,
            retry: RetryPolicy::new(self.settings.fetch_retries),
        }
        .run(counters)
        .map_err(|e| e.to_string())
    }
}
