//! Ingestion workers: drain the queue, validate, upsert with priority,
//! write through to the cache, and hand accepted states to the publisher.
//!
//! Transient store failures retry with exponential backoff up to
//! `max_retries`, then dead-letter. Validation failures are dropped and
//! counted, never retried.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::aircraft_states::validate_state;
use crate::aircraft_states_repo::AircraftStatesRepository;
use crate::event_publisher::EventPublisher;
use crate::events::Event;
use crate::ingest_queue::{DurableQueue, StateMessage};
use crate::live_state_cache::LiveStateCache;

/// First retry delay; doubles per retry.
const RETRY_BASE: Duration = Duration::from_millis(500);

/// Retry delay ceiling.
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Backoff for the n-th retry: `base * 2^retries`, capped.
pub fn retry_backoff(retries: u32) -> Duration {
    let multiplier = 1u64 << retries.min(16);
    RETRY_BASE.saturating_mul(multiplier as u32).min(RETRY_CAP)
}

pub struct IngestionWorker {
    queue: Arc<DurableQueue<StateMessage>>,
    store: AircraftStatesRepository,
    cache: Option<LiveStateCache>,
    publisher: Arc<EventPublisher>,
    batch_size: usize,
    max_retries: u32,
}

impl IngestionWorker {
    pub fn new(
        queue: Arc<DurableQueue<StateMessage>>,
        store: AircraftStatesRepository,
        cache: Option<LiveStateCache>,
        publisher: Arc<EventPublisher>,
        batch_size: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            store,
            cache,
            publisher,
            batch_size: batch_size.max(1),
            max_retries,
        }
    }

    /// Worker loop. Checks the shutdown signal between batches and drains
    /// whatever it already popped before exiting.
    pub async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "Ingestion worker started");
        loop {
            if cancel.is_cancelled() {
                info!(worker_id, "Ingestion worker stopping");
                return;
            }

            let Some(first) = self.queue.pop(Duration::from_millis(500)).await else {
                continue;
            };

            // Coalesce whatever else is immediately available into one
            // store transaction; each message is still acked individually.
            let mut batch = vec![first];
            while batch.len() < self.batch_size {
                match self.queue.try_pop() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }

            self.process_batch(batch).await;
        }
    }

    #[instrument(skip_all, fields(batch = batch.len()))]
    async fn process_batch(&self, batch: Vec<StateMessage>) {
        // Validation first; invalid records are dropped here and never
        // reach the store.
        let mut valid = Vec::with_capacity(batch.len());
        for mut message in batch {
            match validate_state(&mut message.state) {
                Ok(()) => valid.push(message),
                Err(failure) => {
                    metrics::counter!(format!("ingestion.rejected.{}", metric_name(&failure)))
                        .increment(1);
                    debug!(source = ?message.source, "Dropped invalid state: {}", failure);
                }
            }
        }
        if valid.is_empty() {
            return;
        }

        let states: Vec<_> = valid
            .iter()
            .map(|m| (m.state.clone(), m.skip_history))
            .collect();

        match self.store.upsert_batch(states).await {
            Ok(outcomes) => {
                for (message, outcome) in valid.into_iter().zip(outcomes) {
                    if !outcome.accepted() {
                        metrics::counter!("ingestion.superseded").increment(1);
                        continue;
                    }
                    metrics::counter!("ingestion.accepted").increment(1);

                    // Store first, then cache: readers never see a cache
                    // entry the store rejected.
                    if let Some(cache) = &self.cache {
                        cache.upsert(message.state.clone());
                    }

                    let event = Event::position_updated(&message.state);
                    if let Err(e) = self.publisher.publish(event).await {
                        error!("Failed to publish event for {}: {}", message.state.icao24, e);
                    }
                }
            }
            Err(err) if err.retryable() => {
                warn!("Store transient failure, rescheduling batch: {}", err);
                metrics::counter!("ingestion.store_retries").increment(1);
                for mut message in valid {
                    message.retries += 1;
                    if message.retries > self.max_retries {
                        self.queue.dead_letter(
                            message,
                            &format!("store failed after {} retries: {err}", self.max_retries),
                        );
                    } else {
                        let delay = retry_backoff(message.retries);
                        self.queue.reschedule(message, delay);
                    }
                }
            }
            Err(err) => {
                error!("Store permanent failure, dead-lettering batch: {}", err);
                for message in valid {
                    self.queue.dead_letter(message, &err.to_string());
                }
            }
        }
    }
}

fn metric_name(failure: &crate::aircraft_states::ValidationFailure) -> &'static str {
    use crate::aircraft_states::ValidationFailure::*;
    match failure {
        MissingIcao24 => "missing_icao24",
        MalformedIcao24 => "malformed_icao24",
        CoordinateOutOfRange => "coordinate_out_of_range",
        ContactBeforePosition => "contact_before_position",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(2), Duration::from_secs(2));
        assert_eq!(retry_backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        assert_eq!(retry_backoff(10), Duration::from_secs(30));
        assert_eq!(retry_backoff(32), Duration::from_secs(30));
    }
}
