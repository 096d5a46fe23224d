//! SQLite-backed store for tokens, cursors, audit trails and mirrored resources

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::traits::{CursorAdvance, IssuedToken, MarketStore};
use crate::models::{
    CursorStatus, Resource, ResourceKind, RunCounters, RunStatus, RunSummary, SyncCursor,
    SyncRun, TokenRecord, UnroutedNotification, UpsertOutcome, UserId, WebhookLogEntry,
    WebhookStats,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- One OAuth credential per seller
            CREATE TABLE token_record (
                user_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                ttl_seconds INTEGER NOT NULL,
                needs_reauth INTEGER NOT NULL DEFAULT 0,
                last_reauth_attempt TEXT,
                last_sync_attempt TEXT,
                created_at TEXT NOT NULL
            );

            -- Incremental sync position per (seller, kind)
            CREATE TABLE sync_cursor (
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                last_sync_at TEXT,
                last_successful_sync TEXT,
                status TEXT NOT NULL DEFAULT 'never_run',
                frequency_minutes INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (user_id, kind)
            );

            -- Append-only run audit trail
            CREATE TABLE sync_run (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                status TEXT NOT NULL,
                items_processed INTEGER NOT NULL DEFAULT 0,
                items_created INTEGER NOT NULL DEFAULT 0,
                items_updated INTEGER NOT NULL DEFAULT 0,
                items_errors INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER,
                error_message TEXT
            );

            CREATE INDEX idx_sync_run_user_kind ON sync_run(user_id, kind, id DESC);
            CREATE INDEX idx_sync_run_status ON sync_run(status, started_at);

            -- Mirrored resources with zstd-compressed JSON payloads
            CREATE TABLE resources (
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                external_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                remote_updated_at TEXT,
                PRIMARY KEY (user_id, kind, external_id)
            );

            -- One row per webhook processing attempt
            CREATE TABLE webhook_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                notification_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                resource TEXT NOT NULL,
                user_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                error_message TEXT,
                raw_payload TEXT NOT NULL,
                processed_at TEXT NOT NULL
            );

            CREATE INDEX idx_webhook_log_user ON webhook_log(user_id, id DESC);
            CREATE INDEX idx_webhook_log_processed_at ON webhook_log(processed_at);

            -- Running totals per (seller, topic)
            CREATE TABLE webhook_stats (
                user_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                total_received INTEGER NOT NULL DEFAULT 0,
                total_success INTEGER NOT NULL DEFAULT 0,
                total_errors INTEGER NOT NULL DEFAULT 0,
                last_processed TEXT,
                PRIMARY KEY (user_id, topic)
            );

            -- Notifications for topics without a handler
            CREATE TABLE unrouted_notifications (
                notification_id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                resource TEXT NOT NULL,
                user_id TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                received_at TEXT NOT NULL
            );
            "#,
        ),
    ])
}

/// Fixed-width RFC 3339 so stored timestamps sort chronologically as text
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {:?}: {}", raw, e)))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, format!("bad timestamp {:?}: {}", raw, e)))
    })
    .transpose()
}

fn get_kind(row: &Row<'_>, idx: usize) -> rusqlite::Result<ResourceKind> {
    let raw: String = row.get(idx)?;
    ResourceKind::parse(&raw).ok_or_else(|| conversion_error(idx, format!("bad kind {:?}", raw)))
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<TokenRecord> {
    Ok(TokenRecord {
        user_id: UserId::new(row.get::<_, String>(0)?),
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        issued_at: get_ts(row, 3)?,
        ttl_seconds: row.get(4)?,
        needs_reauth: row.get(5)?,
        last_reauth_attempt: get_opt_ts(row, 6)?,
        last_sync_attempt: get_opt_ts(row, 7)?,
        created_at: get_ts(row, 8)?,
    })
}

const TOKEN_COLUMNS: &str = "user_id, access_token, refresh_token, issued_at, ttl_seconds,
     needs_reauth, last_reauth_attempt, last_sync_attempt, created_at";

fn cursor_from_row(row: &Row<'_>) -> rusqlite::Result<SyncCursor> {
    let status: String = row.get(4)?;
    Ok(SyncCursor {
        user_id: UserId::new(row.get::<_, String>(0)?),
        kind: get_kind(row, 1)?,
        last_sync_at: get_opt_ts(row, 2)?,
        last_successful_sync: get_opt_ts(row, 3)?,
        status: CursorStatus::parse(&status)
            .ok_or_else(|| conversion_error(4, format!("bad cursor status {:?}", status)))?,
        frequency_minutes: row.get(5)?,
        active: row.get(6)?,
    })
}

const CURSOR_COLUMNS: &str =
    "user_id, kind, last_sync_at, last_successful_sync, status, frequency_minutes, active";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    let status: String = row.get(5)?;
    Ok(SyncRun {
        id: row.get(0)?,
        user_id: UserId::new(row.get::<_, String>(1)?),
        kind: get_kind(row, 2)?,
        started_at: get_ts(row, 3)?,
        completed_at: get_opt_ts(row, 4)?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| conversion_error(5, format!("bad run status {:?}", status)))?,
        counters: RunCounters {
            processed: row.get(6)?,
            created: row.get(7)?,
            updated: row.get(8)?,
            errors: row.get(9)?,
        },
        duration_ms: row.get(10)?,
        error_message: row.get(11)?,
    })
}

const RUN_COLUMNS: &str = "id, user_id, kind, started_at, completed_at, status,
     items_processed, items_created, items_updated, items_errors, duration_ms, error_message";

fn webhook_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookLogEntry> {
    Ok(WebhookLogEntry {
        notification_id: row.get(0)?,
        topic: row.get(1)?,
        resource: row.get(2)?,
        user_id: UserId::new(row.get::<_, String>(3)?),
        success: row.get(4)?,
        attempts: row.get(5)?,
        error_message: row.get(6)?,
        raw_payload: row.get(7)?,
        processed_at: get_ts(row, 8)?,
    })
}

/// SQLite-based store
///
/// A single connection behind a mutex; each trait method takes the lock for
/// exactly one statement or one short transaction.
pub struct SqliteMarketStore {
    conn: Mutex<Connection>,
}

impl SqliteMarketStore {
    /// Open (or create) the database at `db_path` and migrate it
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets webhook reads proceed while a worker writes; NORMAL sync is
        // safe under WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        let store = Self::migrated(conn)?;
        log::info!("[STORE] Opened database at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Private in-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::migrated(conn)
    }

    fn migrated(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection lock poisoned"))
    }
}

impl MarketStore for SqliteMarketStore {
    fn get_token(&self, user_id: &UserId) -> Result<Option<TokenRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM token_record WHERE user_id = ?", TOKEN_COLUMNS),
                [user_id.as_str()],
                token_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn list_tokens(&self) -> Result<Vec<TokenRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM token_record ORDER BY user_id",
            TOKEN_COLUMNS
        ))?;
        let records = stmt
            .query_map([], token_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn store_issued_token(&self, token: &IssuedToken) -> Result<()> {
        let conn = self.conn()?;
        let issued_at = ts(&token.issued_at);
        conn.execute(
            "INSERT INTO token_record
             (user_id, access_token, refresh_token, issued_at, ttl_seconds, needs_reauth, created_at)
             VALUES (?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                issued_at = excluded.issued_at,
                ttl_seconds = excluded.ttl_seconds",
            params![
                token.user_id.as_str(),
                token.access_token,
                token.refresh_token,
                issued_at,
                token.ttl_seconds,
                issued_at,
            ],
        )?;
        Ok(())
    }

    fn mark_needs_reauth(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE token_record SET needs_reauth = 1, last_reauth_attempt = ? WHERE user_id = ?",
            params![ts(&at), user_id.as_str()],
        )?;
        if changed == 0 {
            anyhow::bail!("No token record for user {}", user_id);
        }
        Ok(())
    }

    fn complete_reauth_gap(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE token_record SET needs_reauth = 0, last_sync_attempt = ? WHERE user_id = ?",
            params![ts(&at), user_id.as_str()],
        )?;
        if changed == 0 {
            anyhow::bail!("No token record for user {}", user_id);
        }
        Ok(())
    }

    fn ensure_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_cursor
             (user_id, kind, last_sync_at, last_successful_sync, status, frequency_minutes, active)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, kind) DO NOTHING",
            params![
                cursor.user_id.as_str(),
                cursor.kind.as_str(),
                cursor.last_sync_at.as_ref().map(ts),
                cursor.last_successful_sync.as_ref().map(ts),
                cursor.status.as_str(),
                cursor.frequency_minutes,
                cursor.active,
            ],
        )?;
        Ok(())
    }

    fn get_cursor(&self, user_id: &UserId, kind: ResourceKind) -> Result<Option<SyncCursor>> {
        let conn = self.conn()?;
        let cursor = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sync_cursor WHERE user_id = ? AND kind = ?",
                    CURSOR_COLUMNS
                ),
                params![user_id.as_str(), kind.as_str()],
                cursor_from_row,
            )
            .optional()?;
        Ok(cursor)
    }

    fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_cursor ORDER BY user_id, kind",
            CURSOR_COLUMNS
        ))?;
        let cursors = stmt
            .query_map([], cursor_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cursors)
    }

    fn advance_cursor(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        advance: &CursorAdvance,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_cursor SET
                status = ?,
                last_sync_at = ?,
                last_successful_sync = COALESCE(?, last_successful_sync)
             WHERE user_id = ? AND kind = ?",
            params![
                advance.status.as_str(),
                ts(&advance.last_sync_at),
                advance.last_successful_sync.as_ref().map(ts),
                user_id.as_str(),
                kind.as_str(),
            ],
        )?;
        if changed == 0 {
            anyhow::bail!("No {} cursor for user {}", kind, user_id);
        }
        Ok(())
    }

    fn set_cursor_active(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        active: bool,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_cursor SET active = ? WHERE user_id = ? AND kind = ?",
            params![active, user_id.as_str(), kind.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn start_sync_run(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_run (user_id, kind, started_at, status) VALUES (?, ?, ?, 'running')",
            params![user_id.as_str(), kind.as_str(), ts(&started_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn finish_sync_run(&self, run_id: i64, summary: &RunSummary) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_run SET
                completed_at = ?,
                status = ?,
                items_processed = ?,
                items_created = ?,
                items_updated = ?,
                items_errors = ?,
                duration_ms = ?,
                error_message = ?
             WHERE id = ? AND status = 'running'",
            params![
                ts(&summary.completed_at),
                summary.status.as_str(),
                summary.counters.processed,
                summary.counters.created,
                summary.counters.updated,
                summary.counters.errors,
                summary.duration_ms,
                summary.error_message,
                run_id,
            ],
        )?;
        Ok(changed == 1)
    }

    fn get_sync_run(&self, run_id: i64) -> Result<Option<SyncRun>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM sync_run WHERE id = ?", RUN_COLUMNS),
                [run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn list_sync_runs(
        &self,
        user_id: &UserId,
        kind: Option<ResourceKind>,
        limit: usize,
    ) -> Result<Vec<SyncRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_run
             WHERE user_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY id DESC
             LIMIT ?3",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(
                params![user_id.as_str(), kind.map(|k| k.as_str()), limit as i64],
                run_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn fail_stale_runs(&self, before: DateTime<Utc>, message: &str) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_run SET status = 'error', completed_at = ?, error_message = ?
             WHERE status = 'running' AND started_at < ?",
            params![ts(&before), message, ts(&before)],
        )?;
        Ok(changed)
    }

    fn upsert_resource(&self, resource: &Resource) -> Result<UpsertOutcome> {
        let json = serde_json::to_vec(&resource.payload).context("Failed to encode payload")?;
        let payload = zstd::encode_all(json.as_slice(), 3).context("Failed to compress payload")?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM resources WHERE user_id = ? AND kind = ? AND external_id = ?)",
            params![
                resource.user_id.as_str(),
                resource.kind.as_str(),
                resource.external_id
            ],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO resources (user_id, kind, external_id, payload, remote_updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, kind, external_id) DO UPDATE SET
                payload = excluded.payload,
                remote_updated_at = excluded.remote_updated_at",
            params![
                resource.user_id.as_str(),
                resource.kind.as_str(),
                resource.external_id,
                payload,
                resource.remote_updated_at.as_ref().map(ts),
            ],
        )?;

        tx.commit()?;

        Ok(if exists {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    fn get_resource(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        external_id: &str,
    ) -> Result<Option<Resource>> {
        let conn = self.conn()?;
        let row: Option<(Vec<u8>, Option<DateTime<Utc>>)> = conn
            .query_row(
                "SELECT payload, remote_updated_at FROM resources
                 WHERE user_id = ? AND kind = ? AND external_id = ?",
                params![user_id.as_str(), kind.as_str(), external_id],
                |row| Ok((row.get(0)?, get_opt_ts(row, 1)?)),
            )
            .optional()?;

        let Some((compressed, remote_updated_at)) = row else {
            return Ok(None);
        };

        let json =
            zstd::decode_all(compressed.as_slice()).context("Failed to decompress payload")?;
        let payload = serde_json::from_slice(&json).context("Failed to decode payload")?;

        Ok(Some(Resource {
            user_id: user_id.clone(),
            kind,
            external_id: external_id.to_string(),
            payload,
            remote_updated_at,
        }))
    }

    fn count_resources(&self, user_id: &UserId, kind: ResourceKind) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE user_id = ? AND kind = ?",
            params![user_id.as_str(), kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn record_webhook(&self, entry: &WebhookLogEntry) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let processed_at = ts(&entry.processed_at);

        tx.execute(
            "INSERT INTO webhook_log
             (notification_id, topic, resource, user_id, success, attempts,
              error_message, raw_payload, processed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.notification_id,
                entry.topic,
                entry.resource,
                entry.user_id.as_str(),
                entry.success,
                entry.attempts,
                entry.error_message,
                entry.raw_payload,
                processed_at,
            ],
        )?;

        tx.execute(
            "INSERT INTO webhook_stats
             (user_id, topic, total_received, total_success, total_errors, last_processed)
             VALUES (?, ?, 1, ?, ?, ?)
             ON CONFLICT(user_id, topic) DO UPDATE SET
                total_received = total_received + 1,
                total_success = total_success + excluded.total_success,
                total_errors = total_errors + excluded.total_errors,
                last_processed = excluded.last_processed",
            params![
                entry.user_id.as_str(),
                entry.topic,
                i64::from(entry.success),
                i64::from(!entry.success),
                processed_at,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn list_webhook_logs(
        &self,
        user_id: Option<&UserId>,
        limit: usize,
    ) -> Result<Vec<WebhookLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT notification_id, topic, resource, user_id, success, attempts,
                    error_message, raw_payload, processed_at
             FROM webhook_log
             WHERE (?1 IS NULL OR user_id = ?1)
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(
                params![user_id.map(|u| u.as_str()), limit as i64],
                webhook_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn webhook_stats(&self, user_id: &UserId) -> Result<Vec<WebhookStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT topic, total_received, total_success, total_errors, last_processed
             FROM webhook_stats WHERE user_id = ? ORDER BY topic",
        )?;
        let stats = stmt
            .query_map([user_id.as_str()], |row| {
                Ok(WebhookStats {
                    user_id: user_id.clone(),
                    topic: row.get(0)?,
                    total_received: row.get::<_, i64>(1)? as u64,
                    total_success: row.get::<_, i64>(2)? as u64,
                    total_errors: row.get::<_, i64>(3)? as u64,
                    last_processed: get_opt_ts(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    fn prune_webhook_logs(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM webhook_log WHERE processed_at < ?",
            [ts(&before)],
        )?;
        Ok(deleted)
    }

    fn store_unrouted(&self, notification: &UnroutedNotification) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO unrouted_notifications
             (notification_id, topic, resource, user_id, raw_payload, received_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(notification_id) DO UPDATE SET
                topic = excluded.topic,
                resource = excluded.resource,
                user_id = excluded.user_id,
                raw_payload = excluded.raw_payload",
            params![
                notification.notification_id,
                notification.topic,
                notification.resource,
                notification.user_id.as_str(),
                notification.raw_payload,
                ts(&notification.received_at),
            ],
        )?;
        Ok(())
    }

    fn list_unrouted(&self, limit: usize) -> Result<Vec<UnroutedNotification>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT notification_id, topic, resource, user_id, raw_payload, received_at
             FROM unrouted_notifications
             ORDER BY received_at DESC
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(UnroutedNotification {
                    notification_id: row.get(0)?,
                    topic: row.get(1)?,
                    resource: row.get(2)?,
                    user_id: UserId::new(row.get::<_, String>(3)?),
                    raw_payload: row.get(4)?,
                    received_at: get_ts(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
