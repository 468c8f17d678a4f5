//! Fan-out for accepted states: persist the canonical event, publish it on
//! the pub/sub subject for WebSocket broadcast, and enqueue one delivery per
//! matching webhook subscription.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::events::{EVENTS_SUBJECT, Event};
use crate::ingest_queue::{DeliveryMessage, DurableQueue};
use crate::webhooks::{WebhookDelivery, WebhookEventRow};
use crate::webhooks_repo::WebhooksRepository;

pub struct EventPublisher {
    nats: Option<async_nats::Client>,
    webhooks_repo: WebhooksRepository,
    webhook_queue: Option<Arc<DurableQueue<DeliveryMessage>>>,
}

impl EventPublisher {
    pub fn new(
        nats: Option<async_nats::Client>,
        webhooks_repo: WebhooksRepository,
        webhook_queue: Option<Arc<DurableQueue<DeliveryMessage>>>,
    ) -> Self {
        Self {
            nats,
            webhooks_repo,
            webhook_queue,
        }
    }

    /// Emit one event. Persistence comes first so the event id is durable
    /// before anything references it; pub/sub and webhook fan-out follow.
    pub async fn publish(&self, event: Event) -> Result<()> {
        let row = WebhookEventRow {
            id: event.id,
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
            payload: event.payload.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.webhooks_repo.insert_event(row).await {
            // Fan-out can still proceed; only re-delivery auditing suffers
            error!("Failed to persist event {}: {}", event.id, e);
        }

        self.publish_to_pubsub(&event).await;
        self.fan_out_webhooks(&event).await;

        metrics::counter!("events.published").increment(1);
        Ok(())
    }

    async fn publish_to_pubsub(&self, event: &Event) {
        let Some(nats) = &self.nats else {
            return;
        };
        let body = match event.body() {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to serialize event {}: {}", event.id, e);
                return;
            }
        };
        if let Err(e) = nats.publish(EVENTS_SUBJECT, body.into()).await {
            error!("Failed to publish event {} to pub/sub: {}", event.id, e);
            metrics::counter!("events.pubsub_errors").increment(1);
        }
    }

    async fn fan_out_webhooks(&self, event: &Event) {
        let Some(queue) = &self.webhook_queue else {
            return;
        };

        // Shed non-essential event types above the high-water mark; position
        // updates always go through.
        if queue.is_backpressured() && !Event::is_essential(&event.event_type) {
            warn!(
                event_type = %event.event_type,
                "Webhook queue over high-water mark, shedding non-essential event"
            );
            metrics::counter!("events.webhook_shed").increment(1);
            return;
        }

        let subscriptions = match self
            .webhooks_repo
            .active_subscriptions_for(&event.event_type)
            .await
        {
            Ok(subs) => subs,
            Err(e) => {
                error!("Failed to look up subscriptions: {}", e);
                return;
            }
        };
        if subscriptions.is_empty() {
            return;
        }

        let deliveries: Vec<WebhookDelivery> = subscriptions
            .iter()
            .map(|sub| WebhookDelivery::pending(event.id, sub.id))
            .collect();

        let messages: Vec<DeliveryMessage> = deliveries
            .iter()
            .map(|delivery| DeliveryMessage {
                delivery_id: delivery.id,
                event_id: delivery.event_id,
                subscription_id: delivery.subscription_id,
                attempt: 0,
                retries: 0,
                available_at: Utc::now().timestamp_millis(),
            })
            .collect();

        if let Err(e) = self.webhooks_repo.insert_deliveries(deliveries).await {
            error!("Failed to create delivery rows for event {}: {}", event.id, e);
            return;
        }

        debug!(
            event_id = %event.id,
            subscriptions = messages.len(),
            "Enqueued webhook deliveries"
        );
        queue.enqueue_batch(messages);
    }
}
