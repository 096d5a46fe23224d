//! Market crate - Sync control plane for a marketplace mirror
//!
//! This crate keeps a local mirror of a seller's marketplace data consistent
//! despite an unreliable network, expiring OAuth credentials, and an
//! at-least-once notification feed:
//! - Domain models (TokenRecord, SyncCursor, SyncRun, webhook audit records)
//! - OAuth token endpoint and marketplace REST clients
//! - Storage trait with SQLite and in-memory backends
//! - Token renewal, serialized per seller, and re-authorization gap backfill
//! - Incremental sync runs driven by a sweep over a bounded worker pool
//! - Webhook normalization, routing and audit
//!
//! All network I/O is blocking; callers run it on worker threads or, for
//! inbound notifications, on an async runtime's blocking pool.

pub mod clock;
pub mod config;
pub mod models;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod tokens;
pub mod webhook;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MarketCredentials, SyncSettings};
pub use models::{
    CursorStatus, Resource, ResourceKind, RunCounters, RunStatus, RunSummary, SyncCursor,
    SyncRun, TokenRecord, Topic, UnroutedNotification, UpsertOutcome, UserId, WebhookLogEntry,
    WebhookNotification, WebhookStats,
};
pub use remote::{
    ApiError, HttpMarketplaceApi, MarketplaceApi, OAuthClient, RetryPolicy, SearchPage,
    SearchQuery, TokenEndpoint, TokenGrant,
};
pub use storage::{CursorAdvance, InMemoryMarketStore, IssuedToken, MarketStore, SqliteMarketStore};
pub use sync::{
    JobOutcome, ResourceSyncer, RunOutcome, SubmitError, SweepJob, SweepReport, SyncScheduler,
    WorkerPool,
};
pub use tokens::{GapOutcome, GapStats, ReauthGapSyncer, RenewOutcome, TokenError, TokenRefresher};
pub use webhook::{Acknowledgement, NormalizeError, WebhookDispatcher, normalize};
