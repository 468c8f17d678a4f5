//! Webhook delivery worker: sign, POST, retry with jittered backoff,
//! circuit-break, and dead-letter.
//!
//! Deliveries are at-least-once; subscribers dedup on `X-Webhook-Id`.
//! Redirects are never followed so a signature can only reach the URL the
//! subscriber registered.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngExt;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreakers;
use crate::config::WebhooksConfig;
use crate::errors::DeliveryError;
use crate::ingest_queue::{DeliveryMessage, DurableQueue};
use crate::rate_limit_window::{RateDecision, RateLimitWindows};
use crate::webhooks::{DeliveryStatus, WebhookSubscription};
use crate::webhooks_repo::WebhooksRepository;

/// Per-attempt POST timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry delays never exceed one hour.
const MAX_BACKOFF_MS: u64 = 3_600_000;

/// Compute the signature header value for an event body:
/// `sha256=<hex of HMAC-SHA256(secret, body)>`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Backoff for a completed attempt number (1-based): `backoff_ms *
/// 2^(attempt-1)`, jittered ±20%, capped at one hour.
pub fn backoff_with_jitter(backoff_ms: u64, attempt: u32, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(22);
    let base = backoff_ms.saturating_mul(1u64 << exponent).min(MAX_BACKOFF_MS);
    let jittered = (base as f64 * (1.0 + jitter.clamp(-0.2, 0.2))).max(0.0) as u64;
    Duration::from_millis(jittered.min(MAX_BACKOFF_MS))
}

pub struct WebhookDeliverer {
    client: reqwest::Client,
    repo: WebhooksRepository,
    queue: Arc<DurableQueue<DeliveryMessage>>,
    breakers: Arc<CircuitBreakers>,
    windows: Arc<RateLimitWindows>,
    config: WebhooksConfig,
}

impl WebhookDeliverer {
    pub fn new(
        repo: WebhooksRepository,
        queue: Arc<DurableQueue<DeliveryMessage>>,
        breakers: Arc<CircuitBreakers>,
        windows: Arc<RateLimitWindows>,
        config: WebhooksConfig,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DELIVERY_TIMEOUT)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client"),
            repo,
            queue,
            breakers,
            windows,
            config,
        }
    }

    /// Drain the webhook queue until shutdown. In-flight deliveries finish
    /// before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Webhook deliverer started");
        loop {
            if cancel.is_cancelled() {
                info!("Webhook deliverer stopping");
                return;
            }
            let Some(message) = self.queue.pop(Duration::from_millis(500)).await else {
                continue;
            };
            self.handle(message).await;
        }
    }

    async fn handle(&self, message: DeliveryMessage) {
        let subscription = match self.repo.get_subscription(message.subscription_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => {
                self.terminate(&message, message.attempt, None, "subscription no longer exists")
                    .await;
                return;
            }
            Err(e) => {
                warn!("Subscription lookup failed, requeueing: {}", e);
                self.queue.reschedule(message, Duration::from_secs(5));
                return;
            }
        };

        if !subscription.is_active() {
            self.terminate(&message, message.attempt, None, "subscription inactive")
                .await;
            return;
        }

        // Breaker first: a tripped subscriber gets no POST at all
        if let Some(until) = self.breakers.tripped_until(subscription.id) {
            let wait = (until - Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
            debug!(
                subscription_id = %subscription.id,
                "Breaker open, rescheduling delivery to {}",
                until
            );
            metrics::counter!("webhooks.breaker_deferred").increment(1);
            self.queue.reschedule(message, wait);
            return;
        }

        // Then the subscriber's sliding-window budget
        let limit = if subscription.rate_limit_per_minute > 0 {
            subscription.rate_limit_per_minute as u32
        } else {
            self.config.subscriber_rate_limit_per_minute
        };
        if let RateDecision::Limited { reset_at } =
            self.windows.check(&subscription.id.to_string(), limit)
        {
            let wait = (reset_at - Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
            debug!(
                subscription_id = %subscription.id,
                "Rate limited, rescheduling delivery to {}",
                reset_at
            );
            metrics::counter!("webhooks.rate_limited").increment(1);
            self.queue.reschedule(message, wait);
            return;
        }

        let attempt = message.attempt + 1;
        match self.attempt_post(&message, &subscription).await {
            Ok(status) => {
                self.breakers.record_success(subscription.id);
                metrics::counter!("webhooks.delivered").increment(1);
                if let Err(e) = self
                    .repo
                    .mark_delivery(
                        message.delivery_id,
                        DeliveryStatus::Delivered,
                        attempt,
                        Some(status as i32),
                        None,
                        None,
                    )
                    .await
                {
                    error!("Failed to mark delivery {} delivered: {}", message.delivery_id, e);
                }
            }
            Err(err) if err.retryable() => {
                self.breakers.record_failure(subscription.id);
                metrics::counter!("webhooks.delivery_failures").increment(1);

                if attempt >= subscription.delivery_max_attempts {
                    self.terminate(&message, attempt, err.status(), &err.to_string())
                        .await;
                    return;
                }

                let jitter = rand::rng().random_range(-0.2..=0.2);
                let delay =
                    backoff_with_jitter(subscription.delivery_backoff_ms as u64, attempt as u32, jitter);
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));

                if let Err(e) = self
                    .repo
                    .mark_delivery(
                        message.delivery_id,
                        DeliveryStatus::Failed,
                        attempt,
                        err.status().map(|s| s as i32),
                        Some(err.to_string()),
                        Some(next_attempt_at),
                    )
                    .await
                {
                    error!("Failed to record delivery failure: {}", e);
                }

                let mut retry = message;
                retry.attempt = attempt;
                retry.retries += 1;
                retry.available_at = next_attempt_at.timestamp_millis();
                self.queue.reschedule(retry, delay);
            }
            Err(err) => {
                // Permanent 4xx: straight to the dead-letter lane. Only
                // retryable failures feed the breaker.
                self.terminate(&message, attempt, err.status(), &err.to_string())
                    .await;
            }
        }
    }

    /// Exactly one outbound POST per call.
    async fn attempt_post(
        &self,
        message: &DeliveryMessage,
        subscription: &WebhookSubscription,
    ) -> Result<u16, DeliveryError> {
        let event = self
            .repo
            .get_event(message.event_id)
            .await
            .map_err(|e| DeliveryError::Retryable {
                status: None,
                message: format!("event lookup failed: {e}"),
            })?
            .ok_or_else(|| DeliveryError::Permanent {
                status: None,
                message: "event row missing".to_string(),
            })?;

        let body = serde_json::to_vec(&crate::events::Event {
            id: event.id,
            event_type: event.event_type.clone(),
            version: crate::events::EVENT_VERSION.to_string(),
            occurred_at: event.occurred_at,
            payload: event.payload.clone(),
        })
        .map_err(|e| DeliveryError::Permanent {
            status: None,
            message: format!("event serialization failed: {e}"),
        })?;

        let signature = sign_payload(&subscription.signing_secret, &body);

        let response = self
            .client
            .post(&subscription.callback_url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Id", message.delivery_id.to_string())
            .header("X-Webhook-Event", &event.event_type)
            .header("X-Webhook-Signature", signature)
            .header("X-Webhook-Timestamp", Utc::now().timestamp().to_string())
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable {
                status: None,
                message: format!("request failed: {e}"),
            })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(status),
            429 | 500..=599 => Err(DeliveryError::Retryable {
                status: Some(status),
                message: format!("subscriber returned {status}"),
            }),
            _ => Err(DeliveryError::Permanent {
                status: Some(status),
                message: format!("subscriber returned {status}"),
            }),
        }
    }

    async fn terminate(
        &self,
        message: &DeliveryMessage,
        attempt: i32,
        status: Option<u16>,
        reason: &str,
    ) {
        metrics::counter!("webhooks.dead_lettered").increment(1);
        if let Err(e) = self
            .repo
            .mark_delivery(
                message.delivery_id,
                DeliveryStatus::DeadLettered,
                attempt,
                status.map(|s| s as i32),
                Some(reason.to_string()),
                None,
            )
            .await
        {
            error!("Failed to mark delivery dead-lettered: {}", e);
        }
        self.queue.dead_letter(message.clone(), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn hmac_sha256_known_vector() {
        // RFC 4231 test case 2: key "Jefe", message "what do ya want for nothing?"
        let signature = sign_payload("Jefe", b"what do ya want for nothing?");
        let expected = hex!("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
        assert_eq!(signature, format!("sha256={}", hex::encode(expected)));
    }

    #[test]
    fn signature_changes_with_secret_and_body() {
        let body = br#"{"type":"aircraft.position.updated"}"#;
        let a = sign_payload("secret-a", body);
        let b = sign_payload("secret-b", body);
        assert_ne!(a, b);
        assert_ne!(sign_payload("secret-a", b"other"), a);
        assert!(a.starts_with("sha256="));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_with_jitter(1000, 1, 0.0), Duration::from_millis(1000));
        assert_eq!(backoff_with_jitter(1000, 2, 0.0), Duration::from_millis(2000));
        assert_eq!(backoff_with_jitter(1000, 3, 0.0), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_jitter_stays_within_20_percent() {
        let low = backoff_with_jitter(1000, 2, -0.2);
        let high = backoff_with_jitter(1000, 2, 0.2);
        assert_eq!(low, Duration::from_millis(1600));
        assert_eq!(high, Duration::from_millis(2400));
        // Out-of-range jitter is clamped
        assert_eq!(backoff_with_jitter(1000, 2, 5.0), high);
    }

    #[test]
    fn backoff_caps_at_one_hour() {
        assert_eq!(
            backoff_with_jitter(1000, 30, 0.2),
            Duration::from_millis(MAX_BACKOFF_MS)
        );
    }
}
