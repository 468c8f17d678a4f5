//! Per-subscriber circuit breakers for webhook delivery.
//!
//! A breaker trips when failures inside a rolling window reach the
//! threshold; it resets on a successful delivery or when the trip expires.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Default)]
struct BreakerState {
    failure_count: u32,
    window_start: Option<DateTime<Utc>>,
    tripped_until: Option<DateTime<Utc>>,
}

pub struct CircuitBreakers {
    breakers: DashMap<Uuid, BreakerState>,
    failure_threshold: u32,
    reset_window: Duration,
}

impl CircuitBreakers {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold: config.failure_threshold,
            reset_window: Duration::seconds(config.reset_seconds as i64),
        }
    }

    /// If the subscription's breaker is open, returns when it closes.
    pub fn tripped_until(&self, subscription_id: Uuid) -> Option<DateTime<Utc>> {
        self.tripped_until_at(subscription_id, Utc::now())
    }

    fn tripped_until_at(&self, subscription_id: Uuid, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let state = self.breakers.get(&subscription_id)?;
        match state.tripped_until {
            Some(until) if until > now => Some(until),
            _ => None,
        }
    }

    /// Record a failed delivery. Returns true when this failure trips the
    /// breaker.
    pub fn record_failure(&self, subscription_id: Uuid) -> bool {
        self.record_failure_at(subscription_id, Utc::now())
    }

    fn record_failure_at(&self, subscription_id: Uuid, now: DateTime<Utc>) -> bool {
        let mut state = self.breakers.entry(subscription_id).or_default();

        // Failures outside the rolling window start a fresh count
        match state.window_start {
            Some(start) if now - start < self.reset_window => {}
            _ => {
                state.window_start = Some(now);
                state.failure_count = 0;
            }
        }

        state.failure_count += 1;
        if state.failure_count >= self.failure_threshold && state.tripped_until.is_none() {
            let until = now + self.reset_window;
            state.tripped_until = Some(until);
            metrics::counter!("webhooks.breaker_trips").increment(1);
            warn!(
                subscription_id = %subscription_id,
                failures = state.failure_count,
                tripped_until = %until,
                "Circuit breaker tripped"
            );
            return true;
        }
        false
    }

    pub fn record_success(&self, subscription_id: Uuid) {
        if let Some(mut state) = self.breakers.get_mut(&subscription_id) {
            if state.tripped_until.is_some() {
                info!(subscription_id = %subscription_id, "Circuit breaker reset");
            }
            *state = BreakerState::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(&CircuitBreakerConfig {
            failure_threshold: 5,
            reset_seconds: 300,
        })
    }

    #[test]
    fn trips_at_threshold_within_window() {
        let breakers = breakers();
        let sub = Uuid::new_v4();
        let now = Utc::now();

        for i in 1..=4 {
            assert!(!breakers.record_failure_at(sub, now + Duration::seconds(i)));
            assert!(breakers
                .tripped_until_at(sub, now + Duration::seconds(i))
                .is_none());
        }
        assert!(breakers.record_failure_at(sub, now + Duration::seconds(5)));
        assert!(breakers
            .tripped_until_at(sub, now + Duration::seconds(6))
            .is_some());
    }

    #[test]
    fn slow_failures_never_trip() {
        let breakers = breakers();
        let sub = Uuid::new_v4();
        let now = Utc::now();

        // One failure every 6 minutes: each starts a fresh window
        for i in 0..10 {
            assert!(!breakers.record_failure_at(sub, now + Duration::seconds(i * 360)));
        }
        assert!(breakers
            .tripped_until_at(sub, now + Duration::seconds(3600))
            .is_none());
    }

    #[test]
    fn trip_expires_on_its_own() {
        let breakers = breakers();
        let sub = Uuid::new_v4();
        let now = Utc::now();

        for _ in 0..5 {
            breakers.record_failure_at(sub, now);
        }
        assert!(breakers.tripped_until_at(sub, now + Duration::seconds(299)).is_some());
        assert!(breakers.tripped_until_at(sub, now + Duration::seconds(301)).is_none());
    }

    #[test]
    fn success_resets_everything() {
        let breakers = breakers();
        let sub = Uuid::new_v4();
        let now = Utc::now();

        for _ in 0..5 {
            breakers.record_failure_at(sub, now);
        }
        breakers.record_success(sub);
        assert!(breakers.tripped_until_at(sub, now).is_none());
        // Four new failures are again below the threshold
        for _ in 0..4 {
            assert!(!breakers.record_failure_at(sub, now));
        }
    }
}
