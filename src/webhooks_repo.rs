use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::PgPool;
use crate::webhooks::{DeliveryStatus, WebhookDelivery, WebhookEventRow, WebhookSubscription};

/// Storage for subscriptions, persisted events, and delivery rows.
#[derive(Clone)]
pub struct WebhooksRepository {
    pool: PgPool,
}

impl WebhooksRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_subscription(
        &self,
        subscription: WebhookSubscription,
    ) -> Result<WebhookSubscription> {
        use crate::schema::webhook_subscriptions::dsl::*;

        let pool = self.pool.clone();
        let record = subscription.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            diesel::insert_into(webhook_subscriptions)
                .values(&record)
                .execute(&mut conn)?;
            Ok(())
        })
        .await??;

        Ok(subscription)
    }

    pub async fn list_subscriptions(&self, subscriber: &str) -> Result<Vec<WebhookSubscription>> {
        use crate::schema::webhook_subscriptions::dsl::*;

        let pool = self.pool.clone();
        let wanted = subscriber.to_string();
        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<WebhookSubscription>> {
            let mut conn = pool.get()?;
            let rows = webhook_subscriptions
                .filter(subscriber_id.eq(&wanted))
                .order(created_at.asc())
                .select(WebhookSubscription::as_select())
                .load::<WebhookSubscription>(&mut conn)?;
            Ok(rows)
        })
        .await??;

        Ok(rows)
    }

    /// Flip a subscription inactive. Returns false when the id is unknown.
    pub async fn deactivate_subscription(&self, sub_id: Uuid) -> Result<bool> {
        use crate::schema::webhook_subscriptions::dsl::*;

        let pool = self.pool.clone();
        let changed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = pool.get()?;
            let changed = diesel::update(webhook_subscriptions.find(sub_id))
                .set((status.eq("inactive"), updated_at.eq(Utc::now())))
                .execute(&mut conn)?;
            Ok(changed)
        })
        .await??;

        Ok(changed > 0)
    }

    /// Active subscriptions that want the given event type.
    pub async fn active_subscriptions_for(
        &self,
        wanted_event_type: &str,
    ) -> Result<Vec<WebhookSubscription>> {
        use crate::schema::webhook_subscriptions::dsl::*;

        let pool = self.pool.clone();
        let wanted = wanted_event_type.to_string();

        let subscriptions =
            tokio::task::spawn_blocking(move || -> Result<Vec<WebhookSubscription>> {
                let mut conn = pool.get()?;
                let rows = webhook_subscriptions
                    .filter(status.eq("active"))
                    .select(WebhookSubscription::as_select())
                    .load::<WebhookSubscription>(&mut conn)?;
                // event_types is a small array per row; filter here rather
                // than fighting the array containment DSL
                Ok(rows.into_iter().filter(|s| s.wants(&wanted)).collect())
            })
            .await??;

        Ok(subscriptions)
    }

    pub async fn get_subscription(&self, sub_id: Uuid) -> Result<Option<WebhookSubscription>> {
        use crate::schema::webhook_subscriptions::dsl::*;

        let pool = self.pool.clone();
        let found = tokio::task::spawn_blocking(move || -> Result<Option<WebhookSubscription>> {
            let mut conn = pool.get()?;
            let row = webhook_subscriptions
                .find(sub_id)
                .select(WebhookSubscription::as_select())
                .first::<WebhookSubscription>(&mut conn)
                .optional()?;
            Ok(row)
        })
        .await??;

        Ok(found)
    }

    /// Persist the canonical event once; duplicate ids are a no-op so event
    /// publication stays idempotent.
    pub async fn insert_event(&self, event: WebhookEventRow) -> Result<()> {
        use crate::schema::webhook_events::dsl::*;

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            diesel::insert_into(webhook_events)
                .values(&event)
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn get_event(&self, lookup_id: Uuid) -> Result<Option<WebhookEventRow>> {
        use crate::schema::webhook_events::dsl::*;

        let pool = self.pool.clone();
        let found = tokio::task::spawn_blocking(move || -> Result<Option<WebhookEventRow>> {
            let mut conn = pool.get()?;
            let row = webhook_events
                .find(lookup_id)
                .select(WebhookEventRow::as_select())
                .first::<WebhookEventRow>(&mut conn)
                .optional()?;
            Ok(row)
        })
        .await??;

        Ok(found)
    }

    pub async fn insert_deliveries(&self, deliveries: Vec<WebhookDelivery>) -> Result<()> {
        use crate::schema::webhook_deliveries::dsl::*;

        if deliveries.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        let count = deliveries.len();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            diesel::insert_into(webhook_deliveries)
                .values(&deliveries)
                .execute(&mut conn)?;
            Ok(())
        })
        .await??;

        metrics::counter!("webhooks.deliveries_created").increment(count as u64);
        Ok(())
    }

    /// Record the outcome of one delivery attempt.
    pub async fn mark_delivery(
        &self,
        delivery_id: Uuid,
        new_status: DeliveryStatus,
        attempt_number: i32,
        http_status: Option<i32>,
        error: Option<String>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        use crate::schema::webhook_deliveries::dsl::*;

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            diesel::update(webhook_deliveries.find(delivery_id))
                .set((
                    status.eq(new_status.as_str()),
                    attempt.eq(attempt_number),
                    response_status.eq(http_status),
                    last_error.eq(error),
                    next_attempt_at.eq(retry_at),
                    updated_at.eq(Utc::now()),
                ))
                .execute(&mut conn)?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}
