//! In-memory storage implementation
//!
//! Used by tests and by tools that do not need durability. Semantics match
//! the SQLite store, including run finalization and stats accounting.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::traits::{CursorAdvance, IssuedToken, MarketStore};
use crate::models::{
    Resource, ResourceKind, RunStatus, RunSummary, SyncCursor, SyncRun, TokenRecord,
    UnroutedNotification, UpsertOutcome, UserId, WebhookLogEntry, WebhookStats,
};

type ResourceKey = (UserId, ResourceKind, String);

/// In-memory implementation of MarketStore
///
/// Uses maps protected by RwLocks for thread-safe access.
#[derive(Default)]
pub struct InMemoryMarketStore {
    tokens: RwLock<HashMap<UserId, TokenRecord>>,
    cursors: RwLock<BTreeMap<(UserId, ResourceKind), SyncCursor>>,
    /// Index is `id - 1`
    runs: RwLock<Vec<SyncRun>>,
    resources: RwLock<HashMap<ResourceKey, Resource>>,
    webhook_logs: RwLock<Vec<WebhookLogEntry>>,
    webhook_stats: RwLock<BTreeMap<(UserId, String), WebhookStats>>,
    unrouted: RwLock<BTreeMap<String, UnroutedNotification>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("store lock poisoned"))
}

impl InMemoryMarketStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarketStore for InMemoryMarketStore {
    fn get_token(&self, user_id: &UserId) -> Result<Option<TokenRecord>> {
        Ok(read(&self.tokens)?.get(user_id).cloned())
    }

    fn list_tokens(&self) -> Result<Vec<TokenRecord>> {
        let mut tokens: Vec<_> = read(&self.tokens)?.values().cloned().collect();
        tokens.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(tokens)
    }

    fn store_issued_token(&self, token: &IssuedToken) -> Result<()> {
        let mut tokens = write(&self.tokens)?;
        match tokens.get_mut(&token.user_id) {
            Some(record) => {
                record.access_token = token.access_token.clone();
                record.refresh_token = token.refresh_token.clone();
                record.issued_at = token.issued_at;
                record.ttl_seconds = token.ttl_seconds;
            }
            None => {
                tokens.insert(
                    token.user_id.clone(),
                    TokenRecord::issued(
                        token.user_id.clone(),
                        token.access_token.clone(),
                        token.refresh_token.clone(),
                        token.ttl_seconds,
                        token.issued_at,
                    ),
                );
            }
        }
        Ok(())
    }

    fn mark_needs_reauth(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        let mut tokens = write(&self.tokens)?;
        let record = tokens
            .get_mut(user_id)
            .ok_or_else(|| anyhow!("No token record for user {}", user_id))?;
        record.needs_reauth = true;
        record.last_reauth_attempt = Some(at);
        Ok(())
    }

    fn complete_reauth_gap(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        let mut tokens = write(&self.tokens)?;
        let record = tokens
            .get_mut(user_id)
            .ok_or_else(|| anyhow!("No token record for user {}", user_id))?;
        record.needs_reauth = false;
        record.last_sync_attempt = Some(at);
        Ok(())
    }

    fn ensure_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        write(&self.cursors)?
            .entry((cursor.user_id.clone(), cursor.kind))
            .or_insert_with(|| cursor.clone());
        Ok(())
    }

    fn get_cursor(&self, user_id: &UserId, kind: ResourceKind) -> Result<Option<SyncCursor>> {
        Ok(read(&self.cursors)?.get(&(user_id.clone(), kind)).cloned())
    }

    fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        Ok(read(&self.cursors)?.values().cloned().collect())
    }

    fn advance_cursor(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        advance: &CursorAdvance,
    ) -> Result<()> {
        let mut cursors = write(&self.cursors)?;
        let cursor = cursors
            .get_mut(&(user_id.clone(), kind))
            .ok_or_else(|| anyhow!("No {} cursor for user {}", kind, user_id))?;
        cursor.status = advance.status;
        cursor.last_sync_at = Some(advance.last_sync_at);
        if let Some(at) = advance.last_successful_sync {
            cursor.last_successful_sync = Some(at);
        }
        Ok(())
    }

    fn set_cursor_active(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        active: bool,
    ) -> Result<bool> {
        match write(&self.cursors)?.get_mut(&(user_id.clone(), kind)) {
            Some(cursor) => {
                cursor.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn start_sync_run(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut runs = write(&self.runs)?;
        let id = runs.len() as i64 + 1;
        runs.push(SyncRun {
            id,
            user_id: user_id.clone(),
            kind,
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            counters: Default::default(),
            duration_ms: None,
            error_message: None,
        });
        Ok(id)
    }

    fn finish_sync_run(&self, run_id: i64, summary: &RunSummary) -> Result<bool> {
        let mut runs = write(&self.runs)?;
        let Some(run) = usize::try_from(run_id - 1)
            .ok()
            .and_then(|idx| runs.get_mut(idx))
        else {
            return Ok(false);
        };
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = summary.status;
        run.counters = summary.counters;
        run.completed_at = Some(summary.completed_at);
        run.duration_ms = Some(summary.duration_ms);
        run.error_message = summary.error_message.clone();
        Ok(true)
    }

    fn get_sync_run(&self, run_id: i64) -> Result<Option<SyncRun>> {
        let runs = read(&self.runs)?;
        Ok(usize::try_from(run_id - 1)
            .ok()
            .and_then(|idx| runs.get(idx))
            .cloned())
    }

    fn list_sync_runs(
        &self,
        user_id: &UserId,
        kind: Option<ResourceKind>,
        limit: usize,
    ) -> Result<Vec<SyncRun>> {
        Ok(read(&self.runs)?
            .iter()
            .rev()
            .filter(|run| &run.user_id == user_id && kind.is_none_or(|k| run.kind == k))
            .take(limit)
            .cloned()
            .collect())
    }

    fn fail_stale_runs(&self, before: DateTime<Utc>, message: &str) -> Result<usize> {
        let mut closed = 0;
        for run in write(&self.runs)?.iter_mut() {
            if run.status == RunStatus::Running && run.started_at < before {
                run.status = RunStatus::Error;
                run.completed_at = Some(before);
                run.error_message = Some(message.to_string());
                closed += 1;
            }
        }
        Ok(closed)
    }

    fn upsert_resource(&self, resource: &Resource) -> Result<UpsertOutcome> {
        let key = (
            resource.user_id.clone(),
            resource.kind,
            resource.external_id.clone(),
        );
        let previous = write(&self.resources)?.insert(key, resource.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Created,
        })
    }

    fn get_resource(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        external_id: &str,
    ) -> Result<Option<Resource>> {
        let key = (user_id.clone(), kind, external_id.to_string());
        Ok(read(&self.resources)?.get(&key).cloned())
    }

    fn count_resources(&self, user_id: &UserId, kind: ResourceKind) -> Result<usize> {
        Ok(read(&self.resources)?
            .keys()
            .filter(|(u, k, _)| u == user_id && *k == kind)
            .count())
    }

    fn record_webhook(&self, entry: &WebhookLogEntry) -> Result<()> {
        // Both locks held so readers never see a log entry without its stats
        let mut logs = write(&self.webhook_logs)?;
        let mut stats = write(&self.webhook_stats)?;

        logs.push(entry.clone());
        stats
            .entry((entry.user_id.clone(), entry.topic.clone()))
            .or_insert_with(|| WebhookStats::empty(entry.user_id.clone(), entry.topic.clone()))
            .apply(entry);
        Ok(())
    }

    fn list_webhook_logs(
        &self,
        user_id: Option<&UserId>,
        limit: usize,
    ) -> Result<Vec<WebhookLogEntry>> {
        Ok(read(&self.webhook_logs)?
            .iter()
            .rev()
            .filter(|entry| user_id.is_none_or(|u| &entry.user_id == u))
            .take(limit)
            .cloned()
            .collect())
    }

    fn webhook_stats(&self, user_id: &UserId) -> Result<Vec<WebhookStats>> {
        Ok(read(&self.webhook_stats)?
            .values()
            .filter(|s| &s.user_id == user_id)
            .cloned()
            .collect())
    }

    fn prune_webhook_logs(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut logs = write(&self.webhook_logs)?;
        let len = logs.len();
        logs.retain(|entry| entry.processed_at >= before);
        Ok(len - logs.len())
    }

    fn store_unrouted(&self, notification: &UnroutedNotification) -> Result<()> {
        let mut unrouted = write(&self.unrouted)?;
        let received_at = unrouted
            .get(&notification.notification_id)
            .map(|existing| existing.received_at)
            .unwrap_or(notification.received_at);
        unrouted.insert(
            notification.notification_id.clone(),
            UnroutedNotification {
                received_at,
                ..notification.clone()
            },
        );
        Ok(())
    }

    fn list_unrouted(&self, limit: usize) -> Result<Vec<UnroutedNotification>> {
        let mut rows: Vec<_> = read(&self.unrouted)?.values().cloned().collect();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CursorStatus, RunCounters};
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-04-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_reissue_preserves_flags() {
        let store = InMemoryMarketStore::new();
        let user = UserId::new("7");
        let token = IssuedToken {
            user_id: user.clone(),
            access_token: "a1".into(),
            refresh_token: "r1".into(),
            issued_at: t0(),
            ttl_seconds: 21_600,
        };
        store.store_issued_token(&token).unwrap();
        store.mark_needs_reauth(&user, t0() + Duration::hours(1)).unwrap();
        store
            .store_issued_token(&IssuedToken {
                access_token: "a2".into(),
                issued_at: t0() + Duration::hours(2),
                ..token
            })
            .unwrap();

        let record = store.get_token(&user).unwrap().unwrap();
        assert_eq!(record.access_token, "a2");
        assert!(record.needs_reauth);
        assert_eq!(record.created_at, t0());
        assert!(record.gap_pending());
    }

    #[test]
    fn test_cursor_advance_keeps_success_on_error() {
        let store = InMemoryMarketStore::new();
        let user = UserId::new("7");
        store
            .ensure_cursor(&SyncCursor::new(user.clone(), ResourceKind::Catalog, 15))
            .unwrap();
        store
            .advance_cursor(
                &user,
                ResourceKind::Catalog,
                &CursorAdvance {
                    status: CursorStatus::Success,
                    last_sync_at: t0(),
                    last_successful_sync: Some(t0()),
                },
            )
            .unwrap();
        store
            .advance_cursor(
                &user,
                ResourceKind::Catalog,
                &CursorAdvance {
                    status: CursorStatus::Error,
                    last_sync_at: t0() + Duration::minutes(15),
                    last_successful_sync: None,
                },
            )
            .unwrap();

        let cursor = store.get_cursor(&user, ResourceKind::Catalog).unwrap().unwrap();
        assert_eq!(cursor.last_successful_sync, Some(t0()));
        assert_eq!(cursor.status, CursorStatus::Error);
    }

    #[test]
    fn test_run_finalized_once() {
        let store = InMemoryMarketStore::new();
        let user = UserId::new("7");
        let id = store.start_sync_run(&user, ResourceKind::Sales, t0()).unwrap();
        let summary = RunSummary {
            status: RunStatus::Success,
            counters: RunCounters::default(),
            completed_at: t0(),
            duration_ms: 5,
            error_message: None,
        };
        assert!(store.finish_sync_run(id, &summary).unwrap());
        assert!(!store.finish_sync_run(id, &summary).unwrap());
        assert!(!store.finish_sync_run(99, &summary).unwrap());
    }

    #[test]
    fn test_webhook_stats_fold() {
        let store = InMemoryMarketStore::new();
        let user = UserId::new("7");
        let entry = WebhookLogEntry {
            notification_id: "n".into(),
            topic: "items".into(),
            resource: "/items/MLB1".into(),
            user_id: user.clone(),
            success: false,
            attempts: 2,
            error_message: Some("boom".into()),
            raw_payload: "{}".into(),
            processed_at: t0(),
        };
        store.record_webhook(&entry).unwrap();
        store
            .record_webhook(&WebhookLogEntry {
                success: true,
                error_message: None,
                ..entry
            })
            .unwrap();

        let stats = store.webhook_stats(&user).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(
            (stats[0].total_received, stats[0].total_success, stats[0].total_errors),
            (2, 1, 1)
        );
    }
}
