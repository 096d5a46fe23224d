//! Backfill of data missed while a seller's credential was invalid
//!
//! Per-item failures are counted but never keep the gap open: retrying one
//! unreachable item forever would stall recovery for the whole seller.
//! Anything missed this way is picked up again when the item next changes
//! or a webhook refers to it.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::{TokenError, TokenRefresher};
use crate::config::SyncSettings;
use crate::models::{ResourceKind, RunCounters, UserId};
use crate::remote::{MarketplaceApi, RetryPolicy};
use crate::sync::ChangeWalk;

/// What a backfill covered
#[derive(Debug, Clone, PartialEq)]
pub struct GapStats {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub counters: RunCounters,
}

/// Result of one `sync_gap` call
#[derive(Debug, Clone, PartialEq)]
pub enum GapOutcome {
    /// No gap is pending
    NotNeeded,
    /// Regular syncs already passed the failure point; flag retired without
    /// contacting the remote
    CaughtUp,
    /// The credential is still burned; nothing can be fetched yet
    AwaitingReauth,
    Completed(GapStats),
    /// A fatal error ended the walk; the gap stays pending
    Failed(String),
}

impl GapOutcome {
    pub fn ok(&self) -> bool {
        matches!(
            self,
            GapOutcome::NotNeeded | GapOutcome::CaughtUp | GapOutcome::Completed(_)
        )
    }
}

/// Walks the re-authorization gap for every tracked kind
pub struct ReauthGapSyncer {
    refresher: Arc<TokenRefresher>,
    api: Arc<dyn MarketplaceApi>,
    lookback: Duration,
    page_size: u32,
    retry: RetryPolicy,
}

impl ReauthGapSyncer {
    pub fn new(
        refresher: Arc<TokenRefresher>,
        api: Arc<dyn MarketplaceApi>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            refresher,
            api,
            lookback: settings.gap_lookback(),
            page_size: settings.page_size,
            retry: RetryPolicy::new(settings.fetch_retries),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Backfill the seller's gap if one is pending.
    ///
    /// Errors never escape: they are logged and reported as `Failed`, and
    /// the gap stays pending for the next sweep.
    pub fn sync_gap(&self, user_id: &UserId) -> GapOutcome {
        match self.try_sync_gap(user_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("[GAP] Backfill for user {} failed: {:#}", user_id, e);
                GapOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    fn try_sync_gap(&self, user_id: &UserId) -> anyhow::Result<GapOutcome> {
        let store = self.refresher.store();
        let record = store
            .get_token(user_id)?
            .ok_or_else(|| TokenError::NotFound(user_id.clone()))?;

        if !record.needs_reauth {
            return Ok(GapOutcome::NotNeeded);
        }
        if record.awaiting_reauth() {
            log::debug!("[GAP] User {} has not re-authorized yet", user_id);
            return Ok(GapOutcome::AwaitingReauth);
        }
        let Some(failed_at) = record.last_reauth_attempt else {
            return Ok(GapOutcome::AwaitingReauth);
        };

        let now = self.refresher.clock().now();

        if let Some(synced_through) = self.oldest_successful_sync(user_id)?
            && synced_through > failed_at
        {
            store.complete_reauth_gap(user_id, now)?;
            log::info!(
                "[GAP] User {} already synced through {}, gap retired",
                user_id,
                synced_through
            );
            return Ok(GapOutcome::CaughtUp);
        }

        let window_start = record.created_at.max(failed_at - self.lookback);
        let access_token = self.refresher.access_token(user_id)?;

        log::info!(
            "[GAP] Backfilling user {} from {} to {}",
            user_id,
            window_start,
            now
        );

        let mut counters = RunCounters::default();
        for kind in ResourceKind::TRACKED {
            ChangeWalk {
                api: self.api.as_ref(),
                store: store.as_ref(),
                access_token: &access_token,
                user_id,
                kind,
                since: window_start,
                page_size: self.page_size,
                retry: self.retry,
            }
            .run(&mut counters)?;
        }

        store.complete_reauth_gap(user_id, now)?;

        if counters.errors > 0 {
            log::warn!(
                "[GAP] User {} gap closed with {} of {} items skipped",
                user_id,
                counters.errors,
                counters.processed
            );
        } else {
            log::info!(
                "[GAP] User {} gap closed: {} created, {} updated",
                user_id,
                counters.created,
                counters.updated
            );
        }

        Ok(GapOutcome::Completed(GapStats {
            window_start,
            window_end: now,
            counters,
        }))
    }

    /// Oldest `last_successful_sync` across tracked kinds; `None` if any
    /// kind has never completed a non-error run
    fn oldest_successful_sync(&self, user_id: &UserId) -> anyhow::Result<Option<DateTime<Utc>>> {
        let store = self.refresher.store();
        let mut oldest: Option<DateTime<Utc>> = None;
        for kind in ResourceKind::TRACKED {
            let Some(at) = store
                .get_cursor(user_id, kind)?
                .and_then(|c| c.last_successful_sync)
            else {
                return Ok(None);
            };
            oldest = Some(oldest.map_or(at, |o| o.min(at)));
        }
        Ok(oldest)
    }
}
