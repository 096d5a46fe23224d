//! Paged "changed since" walk shared by scheduled runs and gap backfills

use chrono::{DateTime, Utc};

use crate::models::{Resource, ResourceKind, RunCounters, UserId};
use crate::remote::{ApiError, MarketplaceApi, RetryPolicy, SearchQuery, fetch_with_retry};
use crate::storage::MarketStore;

/// One walk over the changes to `kind` since `since`
pub(crate) struct ChangeWalk<'a> {
    pub api: &'a dyn MarketplaceApi,
    pub store: &'a dyn MarketStore,
    pub access_token: &'a str,
    pub user_id: &'a UserId,
    pub kind: ResourceKind,
    pub since: DateTime<Utc>,
    pub page_size: u32,
    pub retry: RetryPolicy,
}

impl ChangeWalk<'_> {
    /// Page through the search, fetching and upserting every id.
    ///
    /// Counters are updated in place so a caller still sees partial
    /// progress when the walk ends early. Only a failed search or an
    /// account-level fetch error ends it; a fetch or save failure for one
    /// item is counted and the walk moves on.
    pub fn run(&self, counters: &mut RunCounters) -> Result<(), ApiError> {
        let mut offset: u32 = 0;

        loop {
            let query = SearchQuery {
                user_id: self.user_id.clone(),
                kind: self.kind,
                modified_since: self.since,
                offset,
                limit: self.page_size,
            };
            let page = self.api.search(self.access_token, &query)?;
            if page.ids.is_empty() {
                break;
            }

            log::debug!(
                "[SYNC] {} {} page at offset {}: {} ids of {}",
                self.user_id,
                self.kind,
                offset,
                page.ids.len(),
                page.total
            );

            for id in &page.ids {
                self.process_item(id, counters)?;
            }

            offset = offset.saturating_add(page.ids.len() as u32);
            if u64::from(offset) >= page.total {
                break;
            }
        }

        Ok(())
    }

    fn process_item(&self, id: &str, counters: &mut RunCounters) -> Result<(), ApiError> {
        let payload = match fetch_with_retry(self.api, self.access_token, self.kind, id, self.retry)
        {
            Ok(payload) => payload,
            Err(e) if e.is_item_scoped() => {
                log::warn!(
                    "[SYNC] Skipping {} {} for user {}: {}",
                    self.kind,
                    id,
                    self.user_id,
                    e
                );
                counters.record_error();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let resource = Resource::from_payload(self.user_id.clone(), self.kind, id, payload);
        match self.store.upsert_resource(&resource) {
            Ok(outcome) => counters.record_upsert(outcome),
            Err(e) => {
                log::warn!(
                    "[SYNC] Failed to save {} {} for user {}: {:#}",
                    self.kind,
                    id,
                    self.user_id,
                    e
                );
                counters.record_error();
            }
        }
        Ok(())
    }
}
