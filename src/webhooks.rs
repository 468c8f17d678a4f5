//! Webhook subscription and delivery models.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum entropy for a signing secret, in bytes.
pub const MIN_SIGNING_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::webhook_subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub subscriber_id: String,
    pub callback_url: String,
    pub event_types: Vec<String>,
    pub signing_secret: String,
    pub rate_limit_per_minute: i32,
    pub delivery_max_attempts: i32,
    pub delivery_backoff_ms: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn wants(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|wanted| wanted == event_type)
    }
}

/// Validate a subscription's delivery target. HTTPS is required except for
/// localhost callbacks in development.
pub fn validate_callback_url(url: &str, enforce_https: bool) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid callback URL: {e}"))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = parsed.host_str().unwrap_or_default();
            let is_local = host == "localhost" || host == "127.0.0.1" || host == "::1";
            if !enforce_https || is_local {
                Ok(())
            } else {
                Err("callback URL must use HTTPS".to_string())
            }
        }
        other => Err(format!("unsupported callback scheme: {other}")),
    }
}

pub fn validate_signing_secret(secret: &str) -> Result<(), String> {
    if secret.len() < MIN_SIGNING_SECRET_BYTES {
        return Err(format!(
            "signing secret must be at least {MIN_SIGNING_SECRET_BYTES} bytes"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::webhook_deliveries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub attempt: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub status: String,
    pub response_status: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn pending(event_id: Uuid, subscription_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event_id,
            subscription_id,
            attempt: 0,
            next_attempt_at: Some(now),
            status: DeliveryStatus::Pending.as_str().to_string(),
            response_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persisted canonical event, kept for auditing and so that re-delivery is
/// idempotent from the subscriber's view.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::webhook_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventRow {
    pub id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_callback_accepted() {
        assert!(validate_callback_url("https://example.com/hook", true).is_ok());
    }

    #[test]
    fn plain_http_rejected_unless_localhost() {
        assert!(validate_callback_url("http://example.com/hook", true).is_err());
        assert!(validate_callback_url("http://localhost:3000/hook", true).is_ok());
        assert!(validate_callback_url("http://127.0.0.1:3000/hook", true).is_ok());
        assert!(validate_callback_url("http://example.com/hook", false).is_ok());
    }

    #[test]
    fn garbage_urls_rejected() {
        assert!(validate_callback_url("not a url", true).is_err());
        assert!(validate_callback_url("ftp://example.com/hook", true).is_err());
    }

    #[test]
    fn secret_length_enforced() {
        assert!(validate_signing_secret("short").is_err());
        assert!(validate_signing_secret(&"x".repeat(32)).is_ok());
    }

    #[test]
    fn subscription_event_type_matching() {
        let sub = WebhookSubscription {
            id: Uuid::new_v4(),
            subscriber_id: "acme".to_string(),
            callback_url: "https://example.com/hook".to_string(),
            event_types: vec!["aircraft.position.updated".to_string()],
            signing_secret: "x".repeat(32),
            rate_limit_per_minute: 60,
            delivery_max_attempts: 8,
            delivery_backoff_ms: 1000,
            status: "active".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(sub.is_active());
        assert!(sub.wants("aircraft.position.updated"));
        assert!(!sub.wants("aircraft.landed"));
    }
}
