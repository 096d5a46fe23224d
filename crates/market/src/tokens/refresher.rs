//! Access-token renewal with single-writer-per-seller semantics

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::TokenError;
use crate::clock::Clock;
use crate::models::{TokenRecord, UserId};
use crate::remote::{ApiError, TokenEndpoint, TokenGrant};
use crate::storage::{IssuedToken, MarketStore};

/// Result of one renewal attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RenewOutcome {
    /// New access token stored
    Renewed(TokenRecord),
    /// Endpoint unreachable or refused for a retryable reason; nothing changed
    Transient(String),
    /// Refresh token rejected; `needs_reauth` is now set
    Terminal,
}

impl RenewOutcome {
    pub fn ok(&self) -> bool {
        matches!(self, RenewOutcome::Renewed(_))
    }

    pub fn terminal(&self) -> bool {
        matches!(self, RenewOutcome::Terminal)
    }
}

/// Default margin for renewal on the read path
const READ_RENEW_MARGIN: Duration = Duration::minutes(5);

/// Issues and renews access tokens
///
/// All remote exchanges for one seller happen under that seller's lock. The
/// lock guards only the exchange and the token write that follows it; the
/// store is never locked across the round-trip.
pub struct TokenRefresher {
    store: Arc<dyn MarketStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    read_margin: Duration,
    locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(
        store: Arc<dyn MarketStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            endpoint,
            clock,
            read_margin: READ_RENEW_MARGIN,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Renew on read once the token is within `margin` of expiry
    pub fn with_read_margin(mut self, margin: Duration) -> Self {
        self.read_margin = margin;
        self
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn user_lock(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(user_id.clone()).or_default().clone()
    }

    fn load(&self, user_id: &UserId) -> Result<TokenRecord, TokenError> {
        self.store
            .get_token(user_id)?
            .ok_or_else(|| TokenError::NotFound(user_id.clone()))
    }

    /// Exchange an authorization code, creating or re-issuing the credential.
    ///
    /// Used for onboarding and for re-authorization. A pending gap
    /// (`needs_reauth`) is left in place for gap-sync to clear.
    pub fn exchange_code(
        &self,
        user_id: &UserId,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenRecord, TokenError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let response = self
            .endpoint
            .exchange(TokenGrant::AuthorizationCode { code, redirect_uri })
            .map_err(|e| match e {
                e if e.is_transient() => TokenError::Transient {
                    user: user_id.clone(),
                    message: e.to_string(),
                },
                e => TokenError::Rejected {
                    user: user_id.clone(),
                    message: e.to_string(),
                },
            })?;

        let refresh_token = response.refresh_token.ok_or_else(|| TokenError::Rejected {
            user: user_id.clone(),
            message: "token response carried no refresh token".to_string(),
        })?;

        // A re-issue must sort after both the previous issue and the failed
        // renewal, or the record would still read as awaiting reauth
        let previous = self.store.get_token(user_id)?;
        let floor = previous
            .as_ref()
            .map(|r| r.last_reauth_attempt.map_or(r.issued_at, |a| a.max(r.issued_at)));
        let issued_at = next_issued_at(self.clock.now(), floor);

        self.store.store_issued_token(&IssuedToken {
            user_id: user_id.clone(),
            access_token: response.access_token,
            refresh_token,
            issued_at,
            ttl_seconds: response.expires_in,
        })?;

        match &previous {
            Some(record) if record.needs_reauth => log::info!(
                "[TOKEN] User {} re-authorized; gap since {:?} pending",
                user_id,
                record.last_reauth_attempt
            ),
            Some(_) => log::info!("[TOKEN] User {} re-authorized", user_id),
            None => log::info!("[TOKEN] User {} authorized", user_id),
        }

        self.load(user_id)
    }

    /// Current access token, renewing first if it is close to expiry.
    ///
    /// Fails with `ReauthRequired` without contacting the remote when the
    /// refresh token is known to be burned.
    pub fn access_token(&self, user_id: &UserId) -> Result<String, TokenError> {
        let record = self.load(user_id)?;
        if record.awaiting_reauth() {
            return Err(TokenError::ReauthRequired(user_id.clone()));
        }
        if !record.expires_within(self.read_margin, self.clock.now()) {
            return Ok(record.access_token);
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Another thread may have renewed while we waited
        let record = self.load(user_id)?;
        if record.awaiting_reauth() {
            return Err(TokenError::ReauthRequired(user_id.clone()));
        }
        let now = self.clock.now();
        if !record.expires_within(self.read_margin, now) {
            return Ok(record.access_token);
        }

        match self.renew_locked(&record)? {
            RenewOutcome::Renewed(renewed) => Ok(renewed.access_token),
            RenewOutcome::Terminal => Err(TokenError::ReauthRequired(user_id.clone())),
            // Still inside its lifetime, only inside the margin
            RenewOutcome::Transient(_) if now < record.expires_at() => Ok(record.access_token),
            RenewOutcome::Transient(message) => Err(TokenError::Transient {
                user: user_id.clone(),
                message,
            }),
        }
    }

    /// Renew unconditionally
    pub fn renew(&self, user_id: &UserId) -> Result<RenewOutcome, TokenError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let record = self.load(user_id)?;
        if record.awaiting_reauth() {
            log::debug!("[TOKEN] User {} awaiting re-authorization, not renewing", user_id);
            return Ok(RenewOutcome::Terminal);
        }
        self.renew_locked(&record)
    }

    /// Renew only if the token is within `margin` of expiry; `None` when no
    /// renewal was needed (or possible).
    pub fn renew_if_expiring(
        &self,
        user_id: &UserId,
        margin: Duration,
    ) -> Result<Option<RenewOutcome>, TokenError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let record = self.load(user_id)?;
        if record.awaiting_reauth() || !record.expires_within(margin, self.clock.now()) {
            return Ok(None);
        }
        self.renew_locked(&record).map(Some)
    }

    /// Exchange the refresh token. Caller holds the seller's lock.
    fn renew_locked(&self, record: &TokenRecord) -> Result<RenewOutcome, TokenError> {
        let user_id = &record.user_id;

        match self
            .endpoint
            .exchange(TokenGrant::RefreshToken(&record.refresh_token))
        {
            Ok(response) => {
                let issued_at = next_issued_at(self.clock.now(), Some(record.issued_at));
                self.store.store_issued_token(&IssuedToken {
                    user_id: user_id.clone(),
                    access_token: response.access_token,
                    refresh_token: response
                        .refresh_token
                        .unwrap_or_else(|| record.refresh_token.clone()),
                    issued_at,
                    ttl_seconds: response.expires_in,
                })?;
                log::info!(
                    "[TOKEN] Renewed token for user {} (ttl {}s)",
                    user_id,
                    response.expires_in
                );
                Ok(RenewOutcome::Renewed(self.load(user_id)?))
            }
            Err(ApiError::InvalidGrant(message)) => {
                self.store.mark_needs_reauth(user_id, self.clock.now())?;
                log::warn!(
                    "[TOKEN] Refresh token for user {} rejected, re-authorization required: {}",
                    user_id,
                    message
                );
                Ok(RenewOutcome::Terminal)
            }
            Err(e) => {
                log::warn!("[TOKEN] Renewal for user {} failed: {}", user_id, e);
                Ok(RenewOutcome::Transient(e.to_string()))
            }
        }
    }
}

/// `now`, nudged forward if needed so issue times strictly increase
fn next_issued_at(now: DateTime<Utc>, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + Duration::milliseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::api::TokenResponse;
    use crate::storage::InMemoryMarketStore;
    use std::collections::VecDeque;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-10T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Replays scripted responses and counts calls
    #[derive(Default)]
    struct ScriptedEndpoint {
        responses: Mutex<VecDeque<Result<TokenResponse, ApiError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedEndpoint {
        fn push_ok(&self, access: &str, refresh: Option<&str>) {
            self.responses.lock().unwrap().push_back(Ok(TokenResponse {
                access_token: access.to_string(),
                refresh_token: refresh.map(str::to_string),
                expires_in: 21_600,
                user_id: None,
            }));
        }

        fn push_err(&self, err: ApiError) {
            self.responses.lock().unwrap().push_back(Err(err));
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl TokenEndpoint for ScriptedEndpoint {
        fn exchange(&self, _grant: TokenGrant<'_>) -> Result<TokenResponse, ApiError> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Transient("no scripted response".into())))
        }
    }

    struct Harness {
        store: Arc<InMemoryMarketStore>,
        endpoint: Arc<ScriptedEndpoint>,
        clock: Arc<ManualClock>,
        refresher: TokenRefresher,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryMarketStore::new());
        let endpoint = Arc::new(ScriptedEndpoint::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let refresher = TokenRefresher::new(store.clone(), endpoint.clone(), clock.clone());
        Harness {
            store,
            endpoint,
            clock,
            refresher,
        }
    }

    fn onboard(h: &Harness, user: &UserId) {
        h.endpoint.push_ok("a0", Some("r0"));
        h.refresher.exchange_code(user, "code", "https://localhost/cb").unwrap();
    }

    #[test]
    fn test_fresh_token_served_without_renewal() {
        let h = harness();
        let user = UserId::new("1");
        onboard(&h, &user);

        h.clock.advance(Duration::hours(1));
        assert_eq!(h.refresher.access_token(&user).unwrap(), "a0");
        assert_eq!(h.endpoint.calls(), 1);
    }

    #[test]
    fn test_read_renews_inside_default_margin() {
        let h = harness();
        let user = UserId::new("1");
        onboard(&h, &user);

        h.clock.set(t0() + Duration::seconds(21_400));
        h.endpoint.push_ok("a1", None);
        assert_eq!(h.refresher.access_token(&user).unwrap(), "a1");

        let record = h.store.get_token(&user).unwrap().unwrap();
        assert_eq!(record.refresh_token, "r0");
        assert_eq!(record.issued_at, t0() + Duration::seconds(21_400));
    }

    #[test]
    fn test_invalid_grant_marks_needs_reauth() {
        let h = harness();
        let user = UserId::new("1");
        onboard(&h, &user);

        h.clock.advance(Duration::hours(6));
        h.endpoint.push_err(ApiError::InvalidGrant("expired".into()));
        let outcome = h.refresher.renew(&user).unwrap();
        assert!(!outcome.ok());
        assert!(outcome.terminal());

        let record = h.store.get_token(&user).unwrap().unwrap();
        assert!(record.needs_reauth);
        assert_eq!(record.last_reauth_attempt, Some(t0() + Duration::hours(6)));

        // Burned: reads fail fast without another exchange
        assert!(matches!(
            h.refresher.access_token(&user),
            Err(TokenError::ReauthRequired(_))
        ));
        assert_eq!(h.endpoint.calls(), 2);
    }

    #[test]
    fn test_transient_failure_leaves_record_untouched() {
        let h = harness();
        let user = UserId::new("1");
        onboard(&h, &user);
        let before = h.store.get_token(&user).unwrap().unwrap();

        h.endpoint.push_err(ApiError::Transient("HTTP 503".into()));
        let outcome = h.refresher.renew(&user).unwrap();
        assert_eq!(outcome, RenewOutcome::Transient("transient failure: HTTP 503".into()));
        assert!(!outcome.terminal());
        assert_eq!(h.store.get_token(&user).unwrap().unwrap(), before);
    }

    #[test]
    fn test_transient_failure_on_read_serves_unexpired_token() {
        let h = harness();
        let user = UserId::new("1");
        onboard(&h, &user);

        h.clock.set(t0() + Duration::seconds(21_500));
        h.endpoint.push_err(ApiError::Transient("timeout".into()));
        assert_eq!(h.refresher.access_token(&user).unwrap(), "a0");

        h.clock.set(t0() + Duration::seconds(21_700));
        h.endpoint.push_err(ApiError::Transient("timeout".into()));
        assert!(matches!(
            h.refresher.access_token(&user),
            Err(TokenError::Transient { .. })
        ));
    }

    /// Takes a while to answer, so concurrent readers pile up on the lock
    #[derive(Default)]
    struct SlowEndpoint {
        refreshes: std::sync::atomic::AtomicUsize,
    }

    impl TokenEndpoint for SlowEndpoint {
        fn exchange(&self, grant: TokenGrant<'_>) -> Result<TokenResponse, ApiError> {
            let n = match grant {
                TokenGrant::AuthorizationCode { .. } => 0,
                TokenGrant::RefreshToken(_) => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    self.refreshes
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                        + 1
                }
            };
            Ok(TokenResponse {
                access_token: format!("a{}", n),
                refresh_token: Some(format!("r{}", n)),
                expires_in: 21_600,
                user_id: None,
            })
        }
    }

    #[test]
    fn test_concurrent_reads_renew_once() {
        let store = Arc::new(InMemoryMarketStore::new());
        let endpoint = Arc::new(SlowEndpoint::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let refresher = TokenRefresher::new(store.clone(), endpoint.clone(), clock.clone());
        let user = UserId::new("1");
        refresher.exchange_code(&user, "code", "https://localhost/cb").unwrap();

        clock.set(t0() + Duration::seconds(21_400));
        let tokens: Vec<String> = std::thread::scope(|s| {
            let readers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| refresher.access_token(&user).unwrap()))
                .collect();
            readers.into_iter().map(|r| r.join().unwrap()).collect()
        });

        assert_eq!(endpoint.refreshes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "a1"));
        assert_eq!(store.get_token(&user).unwrap().unwrap().access_token, "a1");
    }

    #[test]
    fn test_renew_unknown_user() {
        let h = harness();
        assert!(matches!(
            h.refresher.renew(&UserId::new("ghost")),
            Err(TokenError::NotFound(_))
        ));
    }

    #[test]
    fn test_issued_at_strictly_increases_under_frozen_clock() {
        let h = harness();
        let user = UserId::new("1");
        onboard(&h, &user);

        let mut last = h.store.get_token(&user).unwrap().unwrap().issued_at;
        for i in 0..3 {
            h.endpoint.push_ok(&format!("a{}", i + 1), None);
            let outcome = h.refresher.renew(&user).unwrap();
            let RenewOutcome::Renewed(record) = outcome else {
                panic!("expected renewal");
            };
            assert!(record.issued_at > last);
            last = record.issued_at;
        }
        assert_eq!(h.store.list_tokens().unwrap().len(), 1);
    }

    #[test]
    fn test_renew_if_expiring_respects_margin() {
        let h = harness();
        let user = UserId::new("1");
        onboard(&h, &user);

        h.clock.set(t0() + Duration::seconds(20_000));
        assert_eq!(
            h.refresher
                .renew_if_expiring(&user, Duration::minutes(10))
                .unwrap(),
            None
        );

        h.clock.set(t0() + Duration::seconds(21_000));
        h.endpoint.push_ok("a1", Some("r1"));
        let outcome = h
            .refresher
            .renew_if_expiring(&user, Duration::minutes(10))
            .unwrap()
            .unwrap();
        assert!(outcome.ok());
    }

    #[test]
    fn test_reauthorization_keeps_gap_pending() {
        let h = harness();
        let user = UserId::new("1");
        onboard(&h, &user);

        h.clock.advance(Duration::hours(7));
        h.endpoint.push_err(ApiError::InvalidGrant("revoked".into()));
        h.refresher.renew(&user).unwrap();

        h.clock.advance(Duration::days(2));
        h.endpoint.push_ok("fresh", Some("fresh-r"));
        let record = h
            .refresher
            .exchange_code(&user, "code2", "https://localhost/cb")
            .unwrap();
        assert!(record.needs_reauth);
        assert!(record.gap_pending());
        assert_eq!(record.created_at, t0());
        assert_eq!(h.refresher.access_token(&user).unwrap(), "fresh");
    }

    #[test]
    fn test_bad_code_is_rejected() {
        let h = harness();
        h.endpoint.push_err(ApiError::InvalidGrant("bad code".into()));
        assert!(matches!(
            h.refresher
                .exchange_code(&UserId::new("1"), "nope", "https://localhost/cb"),
            Err(TokenError::Rejected { .. })
        ));
        assert!(h.store.list_tokens().unwrap().is_empty());
    }

    #[test]
    fn test_next_issued_at() {
        assert_eq!(next_issued_at(t0(), None), t0());
        assert_eq!(
            next_issued_at(t0(), Some(t0())),
            t0() + Duration::milliseconds(1)
        );
        assert_eq!(
            next_issued_at(t0() + Duration::seconds(1), Some(t0())),
            t0() + Duration::seconds(1)
        );
    }
}
