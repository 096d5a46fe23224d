//! Marketplace REST client
//!
//! Provides the "changed since" search and the per-id detail fetch.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use anyhow::{Context, Result};
use std::time::Duration;
use url::Url;

use super::api::{SearchResponse, result_id};
use super::{ApiError, MarketplaceApi, SearchPage, SearchQuery};
use crate::models::ResourceKind;

/// Marketplace API client over HTTPS
pub struct HttpMarketplaceApi {
    agent: ureq::Agent,
    base: Url,
}

impl HttpMarketplaceApi {
    /// Create a client rooted at `base_url` (e.g. `https://api.mercadolibre.com`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("Invalid marketplace API URL: {}", base_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Marketplace API URL cannot carry a path: {}", base_url);
        }

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Ok(Self { agent, base })
    }

    /// Build an endpoint URL from path segments; segments are percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Search endpoint for a kind, with its "modified since" parameter name
    fn search_url(&self, query: &SearchQuery) -> Result<Url, ApiError> {
        let since = query.modified_since.to_rfc3339();
        let mut url = match query.kind {
            ResourceKind::Sales => {
                let mut url = self.endpoint(&["orders", "search"]);
                url.query_pairs_mut()
                    .append_pair("seller", query.user_id.as_str())
                    .append_pair("order.date_last_updated.from", &since)
                    .append_pair("sort", "date_asc");
                url
            }
            ResourceKind::Catalog => {
                let mut url = self.endpoint(&["users", query.user_id.as_str(), "items", "search"]);
                url.query_pairs_mut().append_pair("last_updated.from", &since);
                url
            }
            kind @ ResourceKind::Shipments => return Err(ApiError::NoSearch(kind)),
        };
        url.query_pairs_mut()
            .append_pair("offset", &query.offset.to_string())
            .append_pair("limit", &query.limit.to_string());
        Ok(url)
    }

    fn detail_url(&self, kind: ResourceKind, id: &str) -> Url {
        let collection = match kind {
            ResourceKind::Sales => "orders",
            ResourceKind::Catalog => "items",
            ResourceKind::Shipments => "shipments",
        };
        self.endpoint(&[collection, id])
    }

    /// GET a JSON document, mapping non-2xx statuses onto `ApiError`
    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &Url,
        access_token: &str,
    ) -> Result<T, ApiError> {
        let mut response = self
            .agent
            .get(url.as_str())
            .header("Authorization", &format!("Bearer {}", access_token))
            .header("Accept", "application/json")
            .call()
            .map_err(|e| ApiError::Transient(format!("request failed: {}", e)))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(ApiError::from_status(status, body));
        }

        response
            .body_mut()
            .read_json()
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

impl MarketplaceApi for HttpMarketplaceApi {
    fn search(&self, access_token: &str, query: &SearchQuery) -> Result<SearchPage, ApiError> {
        let url = self.search_url(query)?;
        let response: SearchResponse = self.get_json(&url, access_token)?;

        Ok(SearchPage {
            ids: response.results.iter().filter_map(result_id).collect(),
            total: response.paging.total,
        })
    }

    fn get(
        &self,
        access_token: &str,
        kind: ResourceKind,
        id: &str,
    ) -> Result<serde_json::Value, ApiError> {
        let url = self.detail_url(kind, id);
        self.get_json(&url, access_token)
    }
}

/// Backoff policy for detail fetches
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(100),
        }
    }

    /// Retry without sleeping
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Fetch one resource, retrying transient failures with exponential backoff.
///
/// Non-transient errors (missing resource, rejected token) return at once.
pub fn fetch_with_retry(
    api: &dyn MarketplaceApi,
    access_token: &str,
    kind: ResourceKind,
    id: &str,
    policy: RetryPolicy,
) -> Result<serde_json::Value, ApiError> {
    let mut delay = policy.base_delay;
    let mut attempt = 1;

    loop {
        match api.get(access_token, kind, id) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                log::debug!(
                    "[API] {} {} attempt {}/{} failed: {}",
                    kind,
                    id,
                    attempt,
                    policy.max_attempts,
                    e
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay + Duration::from_millis(rand_jitter()));
                    delay *= 2;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}
