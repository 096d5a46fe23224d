//! OAuth credential record, one per seller

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Stored OAuth credential for a seller
///
/// Created on the first authorization-code exchange and overwritten in place
/// by every renewal. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: String,
    /// When the current access token was issued
    pub issued_at: DateTime<Utc>,
    /// Lifetime of the access token in seconds
    pub ttl_seconds: i64,
    /// Set when the remote rejected the refresh token; cleared only by gap-sync
    pub needs_reauth: bool,
    pub last_reauth_attempt: Option<DateTime<Utc>>,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    /// First exchange for this seller; lower bound for any backfill window
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Create a record from a fresh authorization-code exchange
    pub fn issued(
        user_id: UserId,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            issued_at: now,
            ttl_seconds,
            needs_reauth: false,
            last_reauth_attempt: None,
            last_sync_attempt: None,
            created_at: now,
        }
    }

    /// Instant at which the access token stops being accepted
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.ttl_seconds)
    }

    /// True once `now` is within `margin` of expiry.
    ///
    /// The boundary is inclusive: a token with exactly `margin` left is due.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now >= self.expires_at() - margin
    }

    /// True when the refresh token was rejected and no new credential has
    /// been issued since. Nothing can reach the remote for this seller until
    /// a human re-authorizes.
    pub fn awaiting_reauth(&self) -> bool {
        self.needs_reauth
            && self
                .last_reauth_attempt
                .is_none_or(|attempt| self.issued_at <= attempt)
    }

    /// True when a new credential exists but the data missed while the old
    /// one was invalid has not been backfilled yet.
    pub fn gap_pending(&self) -> bool {
        self.needs_reauth && !self.awaiting_reauth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-10T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_expiry_window() {
        let record = TokenRecord::issued(UserId::new("1"), "a", "r", 21_600, t0());
        let margin = Duration::minutes(5);

        assert!(!record.expires_within(margin, t0() + Duration::seconds(21_000)));
        assert!(record.expires_within(margin, t0() + Duration::seconds(21_300)));
        assert!(record.expires_within(margin, t0() + Duration::seconds(30_000)));
        assert_eq!(record.expires_at(), t0() + Duration::seconds(21_600));
    }

    #[test]
    fn test_awaiting_reauth_until_reissued() {
        let mut record = TokenRecord::issued(UserId::new("1"), "a", "r", 21_600, t0());
        assert!(!record.awaiting_reauth());
        assert!(!record.gap_pending());

        record.needs_reauth = true;
        record.last_reauth_attempt = Some(t0() + Duration::hours(1));
        assert!(record.awaiting_reauth());
        assert!(!record.gap_pending());

        record.issued_at = t0() + Duration::hours(2);
        assert!(!record.awaiting_reauth());
        assert!(record.gap_pending());
    }
}
