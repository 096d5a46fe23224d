//! Periodic sweep: proactive renewals, gap backfills and due sync runs
//!
//! The sweep thread only decides what is due and hands it to the worker
//! pool; no network call ever runs on it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::pool::{SubmitError, WorkerPool};
use super::run::{ResourceSyncer, RunOutcome};
use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::models::{ResourceKind, SyncCursor, TokenRecord, UserId};
use crate::remote::MarketplaceApi;
use crate::storage::MarketStore;
use crate::tokens::{GapOutcome, ReauthGapSyncer, RenewOutcome, TokenError, TokenRefresher};

/// Message recorded on runs left `running` by a previous process
const ABANDONED_RUN_MESSAGE: &str = "abandoned: process exited before the run completed";

/// One unit of sweep work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SweepJob {
    Renew(UserId),
    Gap(UserId),
    Sync(UserId, ResourceKind),
}

impl SweepJob {
    /// Dedupe key in the worker pool
    pub fn key(&self) -> String {
        match self {
            SweepJob::Renew(user) => format!("renew:{}", user),
            SweepJob::Gap(user) => format!("gap:{}", user),
            SweepJob::Sync(user, kind) => format!("sync:{}:{}", user, kind),
        }
    }
}

impl fmt::Display for SweepJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// `None` when the token no longer needed renewing
    Renew(Option<RenewOutcome>),
    Gap(GapOutcome),
    Sync(RunOutcome),
    /// The job returned an error or panicked
    Failed(String),
}

/// Summary of one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub submitted: Vec<SweepJob>,
    /// Skipped because the same job was still queued or running
    pub busy: Vec<SweepJob>,
    /// Skipped because the pool was at capacity
    pub rejected: Vec<SweepJob>,
    pub completed: Vec<(SweepJob, JobOutcome)>,
    /// Still running when the join budget ran out
    pub abandoned: Vec<SweepJob>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.submitted.is_empty() && self.busy.is_empty() && self.rejected.is_empty()
    }

    /// Outcome of a completed job, if it completed in this sweep
    pub fn outcome(&self, job: &SweepJob) -> Option<&JobOutcome> {
        self.completed
            .iter()
            .find(|(j, _)| j == job)
            .map(|(_, outcome)| outcome)
    }
}

/// Sends `Failed` if a job unwinds before reporting
struct Completion {
    job: SweepJob,
    tx: Option<Sender<(SweepJob, JobOutcome)>>,
}

impl Completion {
    fn send(mut self, outcome: JobOutcome) {
        if let Some(tx) = self.tx.take() {
            tx.send((self.job.clone(), outcome)).ok();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send((self.job.clone(), JobOutcome::Failed("job panicked".to_string())))
                .ok();
        }
    }
}

/// Drives renewals, gap-syncs and incremental runs for every seller
pub struct SyncScheduler {
    store: Arc<dyn MarketStore>,
    clock: Arc<dyn Clock>,
    refresher: Arc<TokenRefresher>,
    gap: Arc<ReauthGapSyncer>,
    syncer: Arc<ResourceSyncer>,
    pool: WorkerPool,
    settings: SyncSettings,
    last_prune: Mutex<Option<DateTime<Utc>>>,
}

impl SyncScheduler {
    pub fn new(
        refresher: Arc<TokenRefresher>,
        api: Arc<dyn MarketplaceApi>,
        settings: SyncSettings,
    ) -> Result<Self> {
        let pool = WorkerPool::new(settings.worker_threads, settings.queue_capacity)?;
        let gap = Arc::new(ReauthGapSyncer::new(
            Arc::clone(&refresher),
            Arc::clone(&api),
            &settings,
        ));
        let syncer = Arc::new(ResourceSyncer::new(
            Arc::clone(&refresher),
            api,
            settings.clone(),
        ));

        Ok(Self {
            store: Arc::clone(refresher.store()),
            clock: Arc::clone(refresher.clock()),
            refresher,
            gap,
            syncer,
            pool,
            settings,
            last_prune: Mutex::new(None),
        })
    }

    pub fn refresher(&self) -> &Arc<TokenRefresher> {
        &self.refresher
    }

    pub fn gap_syncer(&self) -> &Arc<ReauthGapSyncer> {
        &self.gap
    }

    pub fn syncer(&self) -> &Arc<ResourceSyncer> {
        &self.syncer
    }

    /// Authorize a seller and create their cursors
    pub fn onboard(
        &self,
        user_id: &UserId,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenRecord, TokenError> {
        let record = self.refresher.exchange_code(user_id, code, redirect_uri)?;
        self.ensure_cursors(user_id)?;
        Ok(record)
    }

    /// Create a `never_run` cursor for every tracked kind that lacks one
    pub fn ensure_cursors(&self, user_id: &UserId) -> Result<()> {
        for kind in ResourceKind::TRACKED {
            self.store.ensure_cursor(&SyncCursor::new(
                user_id.clone(),
                kind,
                self.settings.default_frequency_minutes,
            ))?;
        }
        Ok(())
    }

    /// Pause or resume one cursor; false if it does not exist
    pub fn set_cursor_active(
        &self,
        user_id: &UserId,
        kind: ResourceKind,
        active: bool,
    ) -> Result<bool> {
        let found = self.store.set_cursor_active(user_id, kind, active)?;
        if found {
            log::info!(
                "[SWEEP] {} cursor for user {} {}",
                kind,
                user_id,
                if active { "resumed" } else { "paused" }
            );
        }
        Ok(found)
    }

    /// Close runs a crashed process left `running`. Call once at startup,
    /// before the first sweep.
    pub fn recover_stale_runs(&self) -> Result<usize> {
        let closed = self
            .store
            .fail_stale_runs(self.clock.now(), ABANDONED_RUN_MESSAGE)?;
        if closed > 0 {
            log::warn!("[SWEEP] Closed {} runs abandoned by a previous process", closed);
        }
        Ok(closed)
    }

    /// Jobs due at `now`, in submission order: renewals, then gaps, then syncs
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<SweepJob>> {
        let tokens: HashMap<UserId, TokenRecord> = self
            .store
            .list_tokens()?
            .into_iter()
            .map(|t| (t.user_id.clone(), t))
            .collect();

        let mut users: Vec<&TokenRecord> = tokens.values().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let margin = self.settings.sweep_renew_margin();
        let mut jobs: Vec<SweepJob> = users
            .iter()
            .filter(|t| !t.awaiting_reauth() && t.expires_within(margin, now))
            .map(|t| SweepJob::Renew(t.user_id.clone()))
            .collect();

        jobs.extend(
            users
                .iter()
                .filter(|t| t.gap_pending())
                .map(|t| SweepJob::Gap(t.user_id.clone())),
        );

        // A pending gap walks every tracked kind itself
        for cursor in self.store.list_cursors()? {
            let Some(token) = tokens.get(&cursor.user_id) else {
                continue;
            };
            if cursor.active && !token.needs_reauth && cursor.is_due(now) {
                jobs.push(SweepJob::Sync(cursor.user_id.clone(), cursor.kind));
            }
        }

        Ok(jobs)
    }

    /// Run one sweep and wait for its jobs, up to the run timeout
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        let jobs = match self.due_jobs(now) {
            Ok(jobs) => jobs,
            Err(e) => {
                log::error!("[SWEEP] Could not determine due work: {:#}", e);
                return report;
            }
        };

        let (tx, rx) = mpsc::channel();
        for job in jobs {
            let completion = Completion {
                job: job.clone(),
                tx: Some(tx.clone()),
            };
            let work = self.job_fn(&job);
            match self.pool.submit(job.key(), move || completion.send(work())) {
                Ok(()) => report.submitted.push(job),
                Err(SubmitError::AlreadyQueued) => {
                    log::debug!("[SWEEP] {} still in flight, skipping", job);
                    report.busy.push(job);
                }
                Err(SubmitError::QueueFull) => {
                    log::warn!("[SWEEP] Worker pool full, deferring {}", job);
                    report.rejected.push(job);
                }
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.settings.run_timeout();
        while report.completed.len() < report.submitted.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(done) => report.completed.push(done),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for job in &report.submitted {
            if report.outcome(job).is_none() {
                log::warn!("[SWEEP] {} exceeded the run timeout; abandoned", job);
                report.abandoned.push(job.clone());
            }
        }

        if !report.is_empty() {
            log::info!(
                "[SWEEP] {} submitted, {} completed, {} busy, {} deferred, {} abandoned",
                report.submitted.len(),
                report.completed.len(),
                report.busy.len(),
                report.rejected.len(),
                report.abandoned.len()
            );
        }
        report
    }

    /// The closure a job runs on its worker
    fn job_fn(&self, job: &SweepJob) -> Box<dyn FnOnce() -> JobOutcome + Send> {
        match job.clone() {
            SweepJob::Renew(user) => {
                let refresher = Arc::clone(&self.refresher);
                let margin = self.settings.sweep_renew_margin();
                Box::new(move || match refresher.renew_if_expiring(&user, margin) {
                    Ok(outcome) => JobOutcome::Renew(outcome),
                    Err(e) => {
                        log::error!("[SWEEP] Renewal for user {} failed: {}", user, e);
                        JobOutcome::Failed(e.to_string())
                    }
                })
            }
            SweepJob::Gap(user) => {
                let gap = Arc::clone(&self.gap);
                Box::new(move || JobOutcome::Gap(gap.sync_gap(&user)))
            }
            SweepJob::Sync(user, kind) => {
                let syncer = Arc::clone(&self.syncer);
                Box::new(move || JobOutcome::Sync(syncer.run(&user, kind)))
            }
        }
    }

    /// Daily housekeeping: drop webhook log entries past retention
    pub fn maintenance(&self) {
        let now = self.clock.now();
        {
            let mut last = self.last_prune.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| now - at < Duration::days(1)) {
                return;
            }
            *last = Some(now);
        }

        let before = now - Duration::days(self.settings.webhook_log_retention_days);
        match self.store.prune_webhook_logs(before) {
            Ok(0) => {}
            Ok(n) => log::info!("[SWEEP] Pruned {} webhook log entries before {}", n, before),
            Err(e) => log::error!("[SWEEP] Failed to prune webhook log: {:#}", e),
        }
    }

    /// Sweep every `sweep_interval` until `shutdown` is set
    pub fn run_until(&self, shutdown: &AtomicBool) {
        let interval = self.settings.sweep_interval();
        log::info!(
            "[SWEEP] Starting: every {:?}, {} workers, capacity {}",
            interval,
            self.settings.worker_threads,
            self.pool.capacity()
        );

        while !shutdown.load(Ordering::Relaxed) {
            self.sweep();
            self.maintenance();

            let next = Instant::now() + interval;
            while !shutdown.load(Ordering::Relaxed) && Instant::now() < next {
                let left = next.saturating_duration_since(Instant::now());
                std::thread::sleep(left.min(std::time::Duration::from_millis(250)));
            }
        }

        log::info!("[SWEEP] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::WebhookLogEntry;
    use crate::remote::api::TokenResponse;
    use crate::remote::{ApiError, SearchPage, SearchQuery, TokenEndpoint, TokenGrant};
    use crate::storage::InMemoryMarketStore;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct NoRemote;

    impl TokenEndpoint for NoRemote {
        fn exchange(&self, _: TokenGrant<'_>) -> Result<TokenResponse, ApiError> {
            Ok(TokenResponse {
                access_token: "a".into(),
                refresh_token: Some("r".into()),
                expires_in: 21_600,
                user_id: None,
            })
        }
    }

    impl MarketplaceApi for NoRemote {
        fn search(&self, _: &str, _: &SearchQuery) -> Result<SearchPage, ApiError> {
            Ok(SearchPage::default())
        }

        fn get(&self, _: &str, _: ResourceKind, _: &str) -> Result<serde_json::Value, ApiError> {
            Err(ApiError::NotFound)
        }
    }

    fn scheduler() -> (SyncScheduler, Arc<InMemoryMarketStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryMarketStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let refresher = Arc::new(TokenRefresher::new(
            store.clone(),
            Arc::new(NoRemote),
            clock.clone(),
        ));
        let scheduler =
            SyncScheduler::new(refresher, Arc::new(NoRemote), SyncSettings::default()).unwrap();
        (scheduler, store, clock)
    }

    #[test]
    fn test_job_keys() {
        let user = UserId::new("42");
        assert_eq!(SweepJob::Renew(user.clone()).key(), "renew:42");
        assert_eq!(SweepJob::Gap(user.clone()).key(), "gap:42");
        assert_eq!(
            SweepJob::Sync(user, ResourceKind::Catalog).key(),
            "sync:42:catalog"
        );
    }

    #[test]
    fn test_onboarded_user_is_due_for_every_tracked_kind() {
        let (scheduler, _store, _clock) = scheduler();
        let user = UserId::new("42");
        scheduler.onboard(&user, "code", "cb").unwrap();

        let jobs = scheduler.due_jobs(t0()).unwrap();
        assert_eq!(
            jobs,
            vec![
                SweepJob::Sync(user.clone(), ResourceKind::Sales),
                SweepJob::Sync(user, ResourceKind::Catalog),
            ]
        );
    }

    #[test]
    fn test_paused_cursor_and_unknown_user_are_skipped() {
        let (scheduler, store, _clock) = scheduler();
        let user = UserId::new("42");
        scheduler.onboard(&user, "code", "cb").unwrap();
        assert!(scheduler
            .set_cursor_active(&user, ResourceKind::Sales, false)
            .unwrap());

        // Cursor without any credential
        store
            .ensure_cursor(&SyncCursor::new(UserId::new("orphan"), ResourceKind::Sales, 15))
            .unwrap();

        let jobs = scheduler.due_jobs(t0()).unwrap();
        assert_eq!(jobs, vec![SweepJob::Sync(user, ResourceKind::Catalog)]);
    }

    #[test]
    fn test_maintenance_prunes_once_a_day() {
        let (scheduler, store, clock) = scheduler();
        let entry = |at: DateTime<Utc>| WebhookLogEntry {
            notification_id: "n".into(),
            topic: "items".into(),
            resource: "/items/1".into(),
            user_id: UserId::new("42"),
            success: true,
            attempts: 1,
            error_message: None,
            raw_payload: "{}".into(),
            processed_at: at,
        };
        store.record_webhook(&entry(t0() - Duration::days(45))).unwrap();
        store.record_webhook(&entry(t0() - Duration::days(1))).unwrap();

        scheduler.maintenance();
        assert_eq!(store.list_webhook_logs(None, 10).unwrap().len(), 1);

        store.record_webhook(&entry(t0() - Duration::days(60))).unwrap();
        clock.advance(Duration::hours(2));
        scheduler.maintenance();
        assert_eq!(store.list_webhook_logs(None, 10).unwrap().len(), 2);

        clock.advance(Duration::days(1));
        scheduler.maintenance();
        assert_eq!(store.list_webhook_logs(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_run_until_returns_when_shutdown_is_set() {
        let (scheduler, _store, _clock) = scheduler();
        let shutdown = AtomicBool::new(true);
        scheduler.run_until(&shutdown);
    }
}
