//! Raw notification body -> `WebhookNotification`

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::models::{Topic, UserId, WebhookNotification};

/// Why a payload could not be normalized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),

    #[error("payload is not a JSON object")]
    NotObject,

    #[error("missing or invalid field `{0}`")]
    MissingField(&'static str),
}

/// Normalize a notification body received at `now`.
///
/// Identifier fields may be strings or numbers. `id` falls back to `_id`,
/// `attempts` to 1, and missing or unparseable timestamps to `now`.
pub fn normalize(raw: &[u8], now: DateTime<Utc>) -> Result<WebhookNotification, NormalizeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| NormalizeError::NotJson(e.to_string()))?;
    let Value::Object(body) = value else {
        return Err(NormalizeError::NotObject);
    };

    let notification_id = scalar(&body, "_id")
        .or_else(|| scalar(&body, "id"))
        .ok_or(NormalizeError::MissingField("id"))?;
    let resource = body
        .get("resource")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingField("resource"))?
        .to_string();
    let user_id = scalar(&body, "user_id").ok_or(NormalizeError::MissingField("user_id"))?;
    let topic = body
        .get("topic")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingField("topic"))?;
    let application_id =
        scalar(&body, "application_id").ok_or(NormalizeError::MissingField("application_id"))?;

    let attempts = body
        .get("attempts")
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(1);

    let actions = body
        .get("actions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(WebhookNotification {
        notification_id,
        resource,
        user_id: UserId::new(user_id),
        topic: Topic::parse(topic),
        application_id,
        attempts,
        sent: timestamp(&body, "sent").unwrap_or(now),
        received: timestamp(&body, "received").unwrap_or(now),
        actions,
        raw_payload: String::from_utf8_lossy(raw).into_owned(),
    })
}

/// A non-empty string or a number, as a string
fn scalar(body: &Map<String, Value>, field: &str) -> Option<String> {
    match body.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp(body: &Map<String, Value>, field: &str) -> Option<DateTime<Utc>> {
    body.get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_full_notification() {
        let raw = br#"{
            "_id": "f9f08571-1f65-4c46-9e0a-c0f43faac1c5",
            "resource": "/orders/2000003508419013",
            "user_id": 468424240,
            "topic": "orders_v2",
            "application_id": 5503910054141466,
            "attempts": 3,
            "sent": "2026-07-01T11:59:58.000Z",
            "received": "2026-07-01T11:59:57.926Z",
            "actions": ["status"]
        }"#;
        let n = normalize(raw, now()).unwrap();

        assert_eq!(n.notification_id, "f9f08571-1f65-4c46-9e0a-c0f43faac1c5");
        assert_eq!(n.user_id, UserId::new("468424240"));
        assert_eq!(n.application_id, "5503910054141466");
        assert_eq!(n.topic, Topic::Orders);
        assert_eq!(n.attempts, 3);
        assert_eq!(n.actions, vec!["status".to_string()]);
        assert_eq!(n.resource_id(), Some("2000003508419013"));
        assert!(n.sent < now());
    }

    #[test]
    fn test_defaults() {
        let raw = br#"{"id":"n1","resource":"/items/MLB1","user_id":"7","topic":"items","application_id":"app","sent":"yesterday"}"#;
        let n = normalize(raw, now()).unwrap();
        assert_eq!(n.attempts, 1);
        assert_eq!(n.sent, now());
        assert_eq!(n.received, now());
        assert!(n.actions.is_empty());
        assert_eq!(n.raw_payload.as_bytes(), raw);
    }

    #[test]
    fn test_unknown_topic_is_kept() {
        let raw = br#"{"id":"n1","resource":"/questions/5","user_id":"7","topic":"questions","application_id":"app"}"#;
        assert_eq!(
            normalize(raw, now()).unwrap().topic,
            Topic::Unknown("questions".into())
        );
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            normalize(b"not json", now()),
            Err(NormalizeError::NotJson(_))
        ));
        assert_eq!(normalize(b"[1,2]", now()), Err(NormalizeError::NotObject));
        assert_eq!(
            normalize(
                br#"{"id":"n1","user_id":"7","topic":"items","application_id":"a"}"#,
                now()
            ),
            Err(NormalizeError::MissingField("resource"))
        );
        assert_eq!(
            normalize(
                br#"{"resource":"/items/1","user_id":"7","topic":"items","application_id":"a"}"#,
                now()
            ),
            Err(NormalizeError::MissingField("id"))
        );
        assert_eq!(
            normalize(
                br#"{"id":"n1","resource":"/items/1","user_id":null,"topic":"items","application_id":"a"}"#,
                now()
            ),
            Err(NormalizeError::MissingField("user_id"))
        );
    }
}
