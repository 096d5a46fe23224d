//! Marketplace API integration
//!
//! This module provides:
//! - The OAuth token endpoint (authorization-code and refresh grants)
//! - The resource search and detail endpoints
//! - Classification of remote failures into the error taxonomy the
//!   control plane acts on
//!
//! Both endpoints sit behind traits so the token lifecycle, sync and webhook
//! code can be driven by fakes in tests.

mod auth;
mod client;

pub use auth::OAuthClient;
pub use client::{HttpMarketplaceApi, RetryPolicy, fetch_with_retry};

use crate::models::{ResourceKind, UserId};
use chrono::{DateTime, Utc};

/// Remote failure, classified by what the caller should do about it
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// The refresh token (or code) was rejected; only a human can fix this
    #[error("grant rejected by the token endpoint: {0}")]
    InvalidGrant(String),

    /// The access token was not accepted
    #[error("access token rejected")]
    Unauthorized,

    /// The referenced resource does not exist (or is no longer visible)
    #[error("resource not found")]
    NotFound,

    /// Network failure, timeout, throttling or server error; retry later
    #[error("transient failure: {0}")]
    Transient(String),

    /// Any other client error
    #[error("request rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The response did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The kind has no "changed since" search
    #[error("no search endpoint for {0}")]
    NoSearch(ResourceKind),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    /// Failures confined to one item; a batch carries on past them.
    /// Everything else (credentials, search, shape of the API) is fatal to
    /// the unit of work.
    pub fn is_item_scoped(&self) -> bool {
        matches!(
            self,
            ApiError::NotFound
                | ApiError::Transient(_)
                | ApiError::Decode(_)
                | ApiError::Rejected { .. }
        )
    }

    /// Map a non-success HTTP status on a resource endpoint
    pub(crate) fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => ApiError::Unauthorized,
            404 => ApiError::NotFound,
            429 | 500..=599 => ApiError::Transient(format!("HTTP {}", status)),
            _ => ApiError::Rejected { status, body },
        }
    }
}

/// Which grant to exchange at the token endpoint
#[derive(Debug, Clone, Copy)]
pub enum TokenGrant<'a> {
    AuthorizationCode {
        code: &'a str,
        redirect_uri: &'a str,
    },
    RefreshToken(&'a str),
}

/// The OAuth token endpoint
pub trait TokenEndpoint: Send + Sync {
    fn exchange(&self, grant: TokenGrant<'_>) -> Result<api::TokenResponse, ApiError>;
}

/// One page request against a "changed since" search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub user_id: UserId,
    pub kind: ResourceKind,
    pub modified_since: DateTime<Utc>,
    pub offset: u32,
    pub limit: u32,
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub ids: Vec<String>,
    pub total: u64,
}

/// The resource search and detail endpoints
pub trait MarketplaceApi: Send + Sync {
    fn search(&self, access_token: &str, query: &SearchQuery) -> Result<SearchPage, ApiError>;

    fn get(
        &self,
        access_token: &str,
        kind: ResourceKind,
        id: &str,
    ) -> Result<serde_json::Value, ApiError>;
}

/// Marketplace API response types
pub mod api {
    use serde::Deserialize;

    /// Response from the token endpoint
    #[derive(Debug, Clone, Deserialize)]
    pub struct TokenResponse {
        pub access_token: String,
        pub refresh_token: Option<String>,
        pub expires_in: i64,
        #[serde(default)]
        pub user_id: Option<serde_json::Value>,
    }

    /// Error body returned by the token endpoint
    #[derive(Debug, Deserialize)]
    pub struct OAuthErrorBody {
        pub error: Option<String>,
        pub message: Option<String>,
    }

    /// Search response; results are ids or objects carrying an `id`
    #[derive(Debug, Deserialize)]
    pub struct SearchResponse {
        #[serde(default)]
        pub results: Vec<serde_json::Value>,
        pub paging: Paging,
    }

    #[derive(Debug, Deserialize)]
    pub struct Paging {
        pub total: u64,
    }

    /// Extract an id from a search result entry
    pub fn result_id(value: &serde_json::Value) -> Option<String> {
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Object(map) => map.get("id").and_then(result_id),
            _ => None,
        }
    }
}
