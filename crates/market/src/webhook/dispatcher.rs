//! Routing and audit of inbound notifications

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::normalize::normalize;
use crate::config::SyncSettings;
use crate::models::{
    Resource, ResourceKind, UnroutedNotification, WebhookLogEntry, WebhookNotification,
};
use crate::remote::{MarketplaceApi, RetryPolicy, fetch_with_retry};
use crate::tokens::{TokenError, TokenRefresher};

/// What to tell the platform about one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Handled, or failed in a way redelivery would not fix
    Accepted,
    /// Malformed or addressed to another application
    Rejected,
    /// Local persistence failed; the platform should deliver it again
    Redeliver,
}

/// How a handler ended
#[derive(Debug, Clone, PartialEq)]
enum Handled {
    Done,
    /// Logged as a failure but acknowledged, so the platform does not
    /// redeliver something that will keep failing
    SoftFailure(String),
    /// Local persistence failed; not acknowledged so the platform redelivers
    Redeliver(String),
}

/// Accepts raw notifications, refreshes the referenced resource, and
/// records one log entry per notification
pub struct WebhookDispatcher {
    refresher: Arc<TokenRefresher>,
    api: Arc<dyn MarketplaceApi>,
    application_id: Option<String>,
    retry: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(
        refresher: Arc<TokenRefresher>,
        api: Arc<dyn MarketplaceApi>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            refresher,
            api,
            application_id: settings.application_id.clone(),
            retry: RetryPolicy::new(settings.fetch_retries),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process one raw notification body.
    ///
    /// Redelivery of the same notification is harmless: the resource is
    /// upserted by id, so stored state ends up identical (each delivery
    /// still gets its own log entry).
    pub fn process(&self, raw: &[u8]) -> Acknowledgement {
        let now = self.refresher.clock().now();

        let notification = match normalize(raw, now) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("[WEBHOOK] Rejected malformed notification: {}", e);
                return Acknowledgement::Rejected;
            }
        };

        if let Some(expected) = &self.application_id
            && &notification.application_id != expected
        {
            log::warn!(
                "[WEBHOOK] Notification {} is for application {}, not ours",
                notification.notification_id,
                notification.application_id
            );
            self.record(
                &notification,
                &Handled::SoftFailure(format!(
                    "unexpected application_id {}",
                    notification.application_id
                )),
                now,
            );
            return Acknowledgement::Rejected;
        }

        let handled = match notification.topic.resource_kind() {
            Some(kind) => self.refresh_resource(&notification, kind),
            None => self.keep_unrouted(&notification, now),
        };

        match &handled {
            Handled::Done => log::debug!(
                "[WEBHOOK] {} {} for user {} processed",
                notification.topic.as_str(),
                notification.resource,
                notification.user_id
            ),
            Handled::SoftFailure(message) => log::warn!(
                "[WEBHOOK] {} {} for user {} not refreshed: {}",
                notification.topic.as_str(),
                notification.resource,
                notification.user_id,
                message
            ),
            Handled::Redeliver(message) => log::error!(
                "[WEBHOOK] {} {} for user {} failed, asking for redelivery: {}",
                notification.topic.as_str(),
                notification.resource,
                notification.user_id,
                message
            ),
        }

        let recorded = self.record(&notification, &handled, now);
        if !recorded || matches!(handled, Handled::Redeliver(_)) {
            Acknowledgement::Redeliver
        } else {
            Acknowledgement::Accepted
        }
    }

    /// Fetch the referenced resource and upsert it
    fn refresh_resource(&self, notification: &WebhookNotification, kind: ResourceKind) -> Handled {
        let Some(id) = notification.resource_id() else {
            return Handled::SoftFailure(format!(
                "no resource id in {:?}",
                notification.resource
            ));
        };

        let access_token = match self.refresher.access_token(&notification.user_id) {
            Ok(token) => token,
            Err(TokenError::Store(e)) => return Handled::Redeliver(format!("{:#}", e)),
            Err(e) => return Handled::SoftFailure(e.to_string()),
        };

        let payload = match fetch_with_retry(self.api.as_ref(), &access_token, kind, id, self.retry)
        {
            Ok(payload) => payload,
            Err(e) => return Handled::SoftFailure(e.to_string()),
        };

        let resource = Resource::from_payload(notification.user_id.clone(), kind, id, payload);
        match self.refresher.store().upsert_resource(&resource) {
            Ok(_) => Handled::Done,
            Err(e) => Handled::Redeliver(format!("persistence failure: {:#}", e)),
        }
    }

    /// Persist a notification no handler knows about
    fn keep_unrouted(&self, notification: &WebhookNotification, now: DateTime<Utc>) -> Handled {
        let unrouted = UnroutedNotification {
            notification_id: notification.notification_id.clone(),
            topic: notification.topic.as_str().to_string(),
            resource: notification.resource.clone(),
            user_id: notification.user_id.clone(),
            raw_payload: notification.raw_payload.clone(),
            received_at: now,
        };
        match self.refresher.store().store_unrouted(&unrouted) {
            Ok(()) => Handled::Done,
            Err(e) => Handled::Redeliver(format!("persistence failure: {:#}", e)),
        }
    }

    /// Append the log entry and fold it into stats; false if that failed
    fn record(&self, notification: &WebhookNotification, handled: &Handled, now: DateTime<Utc>) -> bool {
        let error_message = match handled {
            Handled::Done => None,
            Handled::SoftFailure(m) | Handled::Redeliver(m) => Some(m.clone()),
        };
        let entry = WebhookLogEntry {
            notification_id: notification.notification_id.clone(),
            topic: notification.topic.as_str().to_string(),
            resource: notification.resource.clone(),
            user_id: notification.user_id.clone(),
            success: error_message.is_none(),
            attempts: notification.attempts,
            error_message,
            raw_payload: notification.raw_payload.clone(),
            processed_at: now,
        };

        match self.refresher.store().record_webhook(&entry) {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "[WEBHOOK] Failed to record notification {}: {:#}",
                    notification.notification_id,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::UserId;
    use crate::remote::api::TokenResponse;
    use crate::remote::{ApiError, SearchPage, SearchQuery, TokenEndpoint, TokenGrant};
    use crate::storage::{InMemoryMarketStore, MarketStore};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Tokens;

    impl TokenEndpoint for Tokens {
        fn exchange(&self, _: TokenGrant<'_>) -> Result<TokenResponse, ApiError> {
            Ok(TokenResponse {
                access_token: "a".into(),
                refresh_token: Some("r".into()),
                expires_in: 21_600,
                user_id: None,
            })
        }
    }

    /// Items exist unless their id starts with "gone"
    struct Items;

    impl MarketplaceApi for Items {
        fn search(&self, _: &str, _: &SearchQuery) -> Result<SearchPage, ApiError> {
            Ok(SearchPage::default())
        }

        fn get(&self, _: &str, _: ResourceKind, id: &str) -> Result<serde_json::Value, ApiError> {
            if id.starts_with("gone") {
                Err(ApiError::NotFound)
            } else {
                Ok(serde_json::json!({ "id": id, "title": "Lamp" }))
            }
        }
    }

    fn dispatcher(settings: SyncSettings) -> (WebhookDispatcher, Arc<InMemoryMarketStore>) {
        let store = Arc::new(InMemoryMarketStore::new());
        let refresher = Arc::new(TokenRefresher::new(
            store.clone(),
            Arc::new(Tokens),
            Arc::new(ManualClock::new(t0())),
        ));
        refresher.exchange_code(&UserId::new("7"), "c", "cb").unwrap();
        let dispatcher = WebhookDispatcher::new(refresher, Arc::new(Items), &settings)
            .with_retry(RetryPolicy::immediate(1));
        (dispatcher, store)
    }

    fn body(topic: &str, resource: &str) -> Vec<u8> {
        serde_json::json!({
            "_id": "n-1",
            "resource": resource,
            "user_id": 7,
            "topic": topic,
            "application_id": 99,
            "attempts": 1,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_item_notification_upserts() {
        let (dispatcher, store) = dispatcher(SyncSettings::default());
        assert_eq!(dispatcher.process(&body("items", "/items/MLB1")), Acknowledgement::Accepted);

        let user = UserId::new("7");
        let stored = store
            .get_resource(&user, ResourceKind::Catalog, "MLB1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload["title"], "Lamp");

        let logs = store.list_webhook_logs(Some(&user), 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
    }

    #[test]
    fn test_missing_resource_is_soft_failure() {
        let (dispatcher, store) = dispatcher(SyncSettings::default());
        assert_eq!(
            dispatcher.process(&body("orders_v2", "/orders/gone-1")),
            Acknowledgement::Accepted
        );

        let logs = store.list_webhook_logs(None, 10).unwrap();
        assert!(!logs[0].success);
        assert_eq!(logs[0].topic, "orders_v2");
        assert_eq!(logs[0].error_message.as_deref(), Some("resource not found"));
    }

    #[test]
    fn test_unknown_topic_is_persisted() {
        let (dispatcher, store) = dispatcher(SyncSettings::default());
        for _ in 0..2 {
            assert_eq!(
                dispatcher.process(&body("questions", "/questions/5")),
                Acknowledgement::Accepted
            );
        }

        let unrouted = store.list_unrouted(10).unwrap();
        assert_eq!(unrouted.len(), 1);
        assert_eq!(unrouted[0].topic, "questions");
        assert_eq!(store.list_webhook_logs(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_payload_is_not_logged() {
        let (dispatcher, store) = dispatcher(SyncSettings::default());
        assert_eq!(
            dispatcher.process(b"{\"topic\":\"items\"}"),
            Acknowledgement::Rejected
        );
        assert!(store.list_webhook_logs(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_foreign_application_is_refused() {
        let (dispatcher, store) = dispatcher(SyncSettings {
            application_id: Some("12345".into()),
            ..SyncSettings::default()
        });
        assert_eq!(dispatcher.process(&body("items", "/items/MLB1")), Acknowledgement::Rejected);

        let logs = store.list_webhook_logs(None, 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert!(
            store
                .get_resource(&UserId::new("7"), ResourceKind::Catalog, "MLB1")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_unknown_seller_is_soft_failure() {
        let (dispatcher, store) = dispatcher(SyncSettings::default());
        let raw = serde_json::json!({
            "id": "n-2",
            "resource": "/items/MLB1",
            "user_id": "8",
            "topic": "items",
            "application_id": "99",
        })
        .to_string();
        assert_eq!(dispatcher.process(raw.as_bytes()), Acknowledgement::Accepted);

        let stats = store.webhook_stats(&UserId::new("8")).unwrap();
        assert_eq!(stats[0].total_errors, 1);
    }
}
