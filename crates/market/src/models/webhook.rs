//! Inbound push notifications and their audit records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ResourceKind, UserId};

/// Category of an inbound notification
///
/// Closed set of known topics plus `Unknown`, which keeps the raw topic
/// string so new remote topics are persisted rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Orders,
    Items,
    Shipments,
    Unknown(String),
}

impl Topic {
    pub fn parse(s: &str) -> Self {
        match s {
            "orders" | "orders_v2" => Topic::Orders,
            "items" => Topic::Items,
            "shipments" => Topic::Shipments,
            other => Topic::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Topic::Orders => "orders_v2",
            Topic::Items => "items",
            Topic::Shipments => "shipments",
            Topic::Unknown(s) => s,
        }
    }

    /// The mirrored kind a resource-change topic refers to
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        match self {
            Topic::Orders => Some(ResourceKind::Sales),
            Topic::Items => Some(ResourceKind::Catalog),
            Topic::Shipments => Some(ResourceKind::Shipments),
            Topic::Unknown(_) => None,
        }
    }
}

/// A normalized inbound notification (not persisted as-is)
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookNotification {
    pub notification_id: String,
    /// Resource path, e.g. `/orders/2000003508419013`
    pub resource: String,
    pub user_id: UserId,
    pub topic: Topic,
    pub application_id: String,
    pub attempts: u32,
    pub sent: DateTime<Utc>,
    pub received: DateTime<Utc>,
    pub actions: Vec<String>,
    pub raw_payload: String,
}

impl WebhookNotification {
    /// Last segment of the resource path, the id to fetch
    pub fn resource_id(&self) -> Option<&str> {
        self.resource
            .split('?')
            .next()
            .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
            .filter(|id| !id.is_empty())
    }
}

/// One processing attempt, persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookLogEntry {
    pub notification_id: String,
    pub topic: String,
    pub resource: String,
    pub user_id: UserId,
    pub success: bool,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub raw_payload: String,
    pub processed_at: DateTime<Utc>,
}

/// Running totals per `(user, topic)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookStats {
    pub user_id: UserId,
    pub topic: String,
    pub total_received: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub last_processed: Option<DateTime<Utc>>,
}

impl WebhookStats {
    pub fn empty(user_id: UserId, topic: impl Into<String>) -> Self {
        Self {
            user_id,
            topic: topic.into(),
            total_received: 0,
            total_success: 0,
            total_errors: 0,
            last_processed: None,
        }
    }

    /// Fold one log entry into the totals
    pub fn apply(&mut self, entry: &WebhookLogEntry) {
        self.total_received += 1;
        if entry.success {
            self.total_success += 1;
        } else {
            self.total_errors += 1;
        }
        self.last_processed = Some(entry.processed_at);
    }
}

/// A notification whose topic has no dedicated handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnroutedNotification {
    pub notification_id: String,
    pub topic: String,
    pub resource: String,
    pub user_id: UserId,
    pub raw_payload: String,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parse() {
        assert_eq!(Topic::parse("orders_v2"), Topic::Orders);
        assert_eq!(Topic::parse("orders"), Topic::Orders);
        assert_eq!(Topic::parse("items"), Topic::Items);
        assert_eq!(
            Topic::parse("questions"),
            Topic::Unknown("questions".to_string())
        );
        assert_eq!(Topic::parse("questions").as_str(), "questions");
    }

    #[test]
    fn test_topic_kind() {
        assert_eq!(Topic::Orders.resource_kind(), Some(ResourceKind::Sales));
        assert_eq!(Topic::Items.resource_kind(), Some(ResourceKind::Catalog));
        assert_eq!(Topic::Unknown("x".into()).resource_kind(), None);
    }

    #[test]
    fn test_resource_id() {
        let mut n = WebhookNotification {
            notification_id: "n1".into(),
            resource: "/orders/2000003508419013".into(),
            user_id: UserId::new("1"),
            topic: Topic::Orders,
            application_id: "app".into(),
            attempts: 1,
            sent: Utc::now(),
            received: Utc::now(),
            actions: vec![],
            raw_payload: "{}".into(),
        };
        assert_eq!(n.resource_id(), Some("2000003508419013"));

        n.resource = "/items/MLB123/".into();
        assert_eq!(n.resource_id(), Some("MLB123"));

        n.resource = "/shipments/99?x=1".into();
        assert_eq!(n.resource_id(), Some("99"));

        n.resource = "".into();
        assert_eq!(n.resource_id(), None);
    }

    #[test]
    fn test_stats_apply() {
        let mut stats = WebhookStats::empty(UserId::new("1"), "items");
        let mut entry = WebhookLogEntry {
            notification_id: "n1".into(),
            topic: "items".into(),
            resource: "/items/MLB1".into(),
            user_id: UserId::new("1"),
            success: true,
            attempts: 1,
            error_message: None,
            raw_payload: "{}".into(),
            processed_at: Utc::now(),
        };
        stats.apply(&entry);
        entry.success = false;
        stats.apply(&entry);

        assert_eq!(stats.total_received, 2);
        assert_eq!(stats.total_success, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.last_processed, Some(entry.processed_at));
    }
}
