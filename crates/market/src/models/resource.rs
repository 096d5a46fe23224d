//! Mirrored marketplace resources and the identifiers that key them

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marketplace seller identifier
///
/// The platform sends numeric ids in some payloads and strings in others, so
/// the canonical form is the decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of remote entity mirrored locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Orders
    Sales,
    /// Listings
    Catalog,
    /// Shipments, only reachable through webhooks
    Shipments,
}

impl ResourceKind {
    /// Kinds with a "changed since" search, swept by the scheduler and
    /// walked by gap-sync.
    pub const TRACKED: [ResourceKind; 2] = [ResourceKind::Sales, ResourceKind::Catalog];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Sales => "sales",
            ResourceKind::Catalog => "catalog",
            ResourceKind::Shipments => "shipments",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sales" => Some(ResourceKind::Sales),
            "catalog" => Some(ResourceKind::Catalog),
            "shipments" => Some(ResourceKind::Shipments),
            _ => None,
        }
    }

    /// Lookback used on a cursor's first run, before any successful sync
    pub fn default_lookback(&self) -> Duration {
        match self {
            ResourceKind::Sales => Duration::days(7),
            ResourceKind::Catalog => Duration::days(30),
            ResourceKind::Shipments => Duration::days(7),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote resource as stored in the local mirror
///
/// Keyed by `(user_id, kind, external_id)`. Holds only remote-derived data so
/// that upserting the same remote state twice leaves an identical row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub user_id: UserId,
    pub kind: ResourceKind,
    pub external_id: String,
    /// Full detail JSON as returned by the remote
    pub payload: serde_json::Value,
    /// Remote modification time, when the payload carries one
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl Resource {
    /// Build a resource from a detail payload, extracting its modification time
    pub fn from_payload(
        user_id: UserId,
        kind: ResourceKind,
        external_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let remote_updated_at = ["last_updated", "date_last_updated", "last_modified"]
            .iter()
            .filter_map(|field| payload.get(*field).and_then(|v| v.as_str()))
            .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Self {
            user_id,
            kind,
            external_id: external_id.into(),
            payload,
            remote_updated_at,
        }
    }
}

/// Result of upserting one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in [ResourceKind::Sales, ResourceKind::Catalog, ResourceKind::Shipments] {
            assert_eq!(ResourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::parse("questions"), None);
    }

    #[test]
    fn test_default_lookbacks() {
        assert_eq!(ResourceKind::Sales.default_lookback(), Duration::days(7));
        assert_eq!(ResourceKind::Catalog.default_lookback(), Duration::days(30));
    }

    #[test]
    fn test_from_payload_extracts_update_time() {
        let payload = json!({
            "id": 2000001,
            "date_last_updated": "2026-03-01T10:00:00.000-03:00",
        });
        let resource =
            Resource::from_payload(UserId::new("42"), ResourceKind::Sales, "2000001", payload);
        let expected = DateTime::parse_from_rfc3339("2026-03-01T13:00:00Z").unwrap();
        assert_eq!(resource.remote_updated_at, Some(expected.with_timezone(&Utc)));
    }

    #[test]
    fn test_from_payload_without_update_time() {
        let resource = Resource::from_payload(
            UserId::new("42"),
            ResourceKind::Catalog,
            "MLB1",
            json!({ "id": "MLB1", "title": "Lamp" }),
        );
        assert!(resource.remote_updated_at.is_none());
    }
}
