use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use super::json_error;
use crate::events::EVENT_AIRCRAFT_POSITION_UPDATED;
use crate::web::AppState;
use crate::webhooks::{WebhookSubscription, validate_callback_url, validate_signing_secret};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscription {
    pub subscriber_id: String,
    pub callback_url: String,
    #[serde(default)]
    pub event_types: Vec<String>,
    pub signing_secret: String,
    #[serde(default)]
    pub rate_limit_per_minute: Option<i32>,
    #[serde(default)]
    pub delivery_max_attempts: Option<i32>,
    #[serde(default)]
    pub delivery_backoff_ms: Option<i64>,
}

/// POST /webhooks/subscriptions
pub async fn create_subscription(
    State(state): State<AppState>,
    body: axum::extract::Json<CreateSubscription>,
) -> axum::response::Response {
    if body.subscriber_id.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "subscriberId required").into_response();
    }
    if let Err(reason) = validate_callback_url(&body.callback_url, state.enforce_https) {
        return json_error(StatusCode::BAD_REQUEST, &reason).into_response();
    }
    if let Err(reason) = validate_signing_secret(&body.signing_secret) {
        return json_error(StatusCode::BAD_REQUEST, &reason).into_response();
    }

    let now = Utc::now();
    let subscription = WebhookSubscription {
        id: Uuid::new_v4(),
        subscriber_id: body.subscriber_id.clone(),
        callback_url: body.callback_url.clone(),
        event_types: if body.event_types.is_empty() {
            vec![EVENT_AIRCRAFT_POSITION_UPDATED.to_string()]
        } else {
            body.event_types.clone()
        },
        signing_secret: body.signing_secret.clone(),
        rate_limit_per_minute: body
            .rate_limit_per_minute
            .unwrap_or(state.webhook_defaults.subscriber_rate_limit_per_minute as i32),
        delivery_max_attempts: body
            .delivery_max_attempts
            .unwrap_or(state.webhook_defaults.max_attempts as i32),
        delivery_backoff_ms: body
            .delivery_backoff_ms
            .unwrap_or(state.webhook_defaults.backoff_ms as i64),
        status: "active".to_string(),
        created_at: now,
        updated_at: now,
    };

    match state.webhooks_repo.create_subscription(subscription).await {
        Ok(created) => {
            info!(
                subscription_id = %created.id,
                subscriber = %created.subscriber_id,
                "Webhook subscription created"
            );
            // The signing secret is write-only; never echo it back
            (
                StatusCode::CREATED,
                Json(json!({
                    "id": created.id,
                    "subscriberId": created.subscriber_id,
                    "callbackUrl": created.callback_url,
                    "eventTypes": created.event_types,
                    "rateLimitPerMinute": created.rate_limit_per_minute,
                    "deliveryMaxAttempts": created.delivery_max_attempts,
                    "deliveryBackoffMs": created.delivery_backoff_ms,
                    "status": created.status,
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to create subscription: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "subscription create failed")
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionQuery {
    pub subscriber_id: String,
}

/// GET /webhooks/subscriptions?subscriberId=
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
) -> axum::response::Response {
    match state
        .webhooks_repo
        .list_subscriptions(&query.subscriber_id)
        .await
    {
        Ok(subscriptions) => {
            let sanitized: Vec<_> = subscriptions
                .into_iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "subscriberId": s.subscriber_id,
                        "callbackUrl": s.callback_url,
                        "eventTypes": s.event_types,
                        "rateLimitPerMinute": s.rate_limit_per_minute,
                        "status": s.status,
                    })
                })
                .collect();
            Json(sanitized).into_response()
        }
        Err(e) => {
            error!("Failed to list subscriptions: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "subscription list failed")
                .into_response()
        }
    }
}

/// DELETE /webhooks/subscriptions/{id}. Deactivates; delivery history stays.
pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    match state.webhooks_repo.deactivate_subscription(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "subscription not found").into_response(),
        Err(e) => {
            error!("Failed to deactivate subscription {}: {}", id, e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "subscription delete failed")
                .into_response()
        }
    }
}
