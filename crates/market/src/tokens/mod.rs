//! OAuth token lifecycle
//!
//! This module provides:
//! - Authorization-code exchange and refresh-token renewal, serialized per
//!   seller so a single-use refresh token is never spent twice
//! - Lazy renewal on read and proactive renewal from the sweep
//! - Backfill of the window a seller was unreachable after a rejected
//!   refresh token

mod gap;
mod refresher;

pub use gap::{GapOutcome, GapStats, ReauthGapSyncer};
pub use refresher::{RenewOutcome, TokenRefresher};

use crate::models::UserId;

/// Failure to produce a usable access token
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No credential has ever been exchanged for this seller
    #[error("no token record for user {0}")]
    NotFound(UserId),

    /// The refresh token was rejected; a human must re-authorize
    #[error("user {0} must re-authorize")]
    ReauthRequired(UserId),

    /// The token endpoint could not be reached; try again later
    #[error("token endpoint unavailable for user {user}: {message}")]
    Transient { user: UserId, message: String },

    /// The token endpoint refused the request for a reason other than a
    /// burned grant (bad client credentials, malformed code)
    #[error("token request for user {user} rejected: {message}")]
    Rejected { user: UserId, message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
