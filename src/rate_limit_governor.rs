//! Per-provider outbound call governor.
//!
//! Providers enforce their quotas globally, so this state is process-local:
//! a blocked-until timestamp plus a consecutive-failure counter driving
//! exponential backoff when the upstream gives no retry-after hint.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

/// Backoff base when a 429 arrives without a retry-after hint.
const BACKOFF_BASE_SECONDS: u64 = 300;

/// Backoff ceiling.
const BACKOFF_CAP_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Default)]
struct ProviderState {
    blocked_until: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    requests_today: u32,
    day: i64,
}

/// Registry of per-provider block state. Checked before every outbound call.
#[derive(Default)]
pub struct RateLimitGovernor {
    providers: DashMap<String, ProviderState>,
    daily_budgets: DashMap<String, u32>,
}

impl RateLimitGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap a provider's calls per UTC day. `None` removes the cap.
    pub fn set_daily_budget(&self, provider: &str, budget: Option<u32>) {
        match budget {
            Some(budget) => {
                self.daily_budgets.insert(provider.to_string(), budget);
            }
            None => {
                self.daily_budgets.remove(provider);
            }
        }
    }

    pub fn is_blocked(&self, provider: &str) -> bool {
        self.is_blocked_at(provider, Utc::now())
    }

    fn is_blocked_at(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let Some(state) = self.providers.get(provider) else {
            return false;
        };
        if matches!(state.blocked_until, Some(until) if until > now) {
            return true;
        }
        if let Some(budget) = self.daily_budgets.get(provider)
            && state.day == day_number(now)
            && state.requests_today >= *budget
        {
            return true;
        }
        false
    }

    /// Count one outbound call against the provider's daily budget. Returns
    /// false when the budget is already spent.
    pub fn record_request(&self, provider: &str) -> bool {
        self.record_request_at(provider, Utc::now())
    }

    fn record_request_at(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.providers.entry(provider.to_string()).or_default();
        let today = day_number(now);
        if state.day != today {
            state.day = today;
            state.requests_today = 0;
        }

        if let Some(budget) = self.daily_budgets.get(provider)
            && state.requests_today >= *budget
        {
            metrics::counter!(format!("provider.{}.budget_exhausted", provider)).increment(1);
            return false;
        }

        state.requests_today += 1;
        true
    }

    /// Record a 429. With a hint, block exactly that long; without one,
    /// back off `min(base * 2^(n-1), cap)`.
    pub fn record_rate_limited(&self, provider: &str, retry_after: Option<Duration>) {
        self.record_rate_limited_at(provider, retry_after, Utc::now());
    }

    fn record_rate_limited_at(
        &self,
        provider: &str,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        let mut state = self.providers.entry(provider.to_string()).or_default();
        state.consecutive_failures += 1;

        let delay = match retry_after {
            Some(hint) => hint,
            None => {
                let exponent = state.consecutive_failures.saturating_sub(1).min(31);
                let seconds =
                    BACKOFF_BASE_SECONDS.saturating_mul(1u64 << exponent).min(BACKOFF_CAP_SECONDS);
                Duration::from_secs(seconds)
            }
        };

        let until = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::hours(1));
        state.blocked_until = Some(until);

        metrics::counter!(format!("provider.{}.rate_limited", provider)).increment(1);
        warn!(
            provider,
            consecutive_failures = state.consecutive_failures,
            blocked_until = %until,
            "Provider rate limited"
        );
    }

    /// Record a non-429 failure so repeated transport errors also widen the
    /// gap between attempts. Does not block outright on the first failure.
    pub fn record_failure(&self, provider: &str) {
        self.record_failure_at(provider, Utc::now());
    }

    fn record_failure_at(&self, provider: &str, now: DateTime<Utc>) {
        let mut state = self.providers.entry(provider.to_string()).or_default();
        state.consecutive_failures += 1;
        metrics::counter!(format!("provider.{}.failures", provider)).increment(1);

        // Only start blocking once failures repeat
        if state.consecutive_failures >= 3 {
            let exponent = (state.consecutive_failures - 3).min(31);
            let seconds = 30u64.saturating_mul(1u64 << exponent).min(BACKOFF_CAP_SECONDS);
            state.blocked_until = Some(now + chrono::Duration::seconds(seconds as i64));
            warn!(
                provider,
                consecutive_failures = state.consecutive_failures,
                "Provider failing repeatedly, backing off {}s",
                seconds
            );
        }
    }

    pub fn record_success(&self, provider: &str) {
        if let Some(mut state) = self.providers.get_mut(provider) {
            if state.consecutive_failures > 0 {
                info!(provider, "Provider recovered");
            }
            state.consecutive_failures = 0;
            state.blocked_until = None;
        }
    }

    /// Seconds until the provider unblocks, for logging and scheduling.
    pub fn blocked_for(&self, provider: &str) -> Option<Duration> {
        let state = self.providers.get(provider)?;
        let until = state.blocked_until?;
        let remaining = until - Utc::now();
        remaining.to_std().ok()
    }
}

fn day_number(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(86_400)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_not_blocked() {
        let governor = RateLimitGovernor::new();
        assert!(!governor.is_blocked("free-network"));
    }

    #[test]
    fn retry_after_hint_blocks_exactly() {
        let governor = RateLimitGovernor::new();
        let now = Utc::now();
        governor.record_rate_limited_at("free-network", Some(Duration::from_secs(60)), now);

        assert!(governor.is_blocked_at("free-network", now + chrono::Duration::seconds(59)));
        assert!(!governor.is_blocked_at("free-network", now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn backoff_doubles_and_caps_without_hint() {
        let governor = RateLimitGovernor::new();
        let now = Utc::now();

        // First 429: 300s
        governor.record_rate_limited_at("aero-api", None, now);
        assert!(governor.is_blocked_at("aero-api", now + chrono::Duration::seconds(299)));
        assert!(!governor.is_blocked_at("aero-api", now + chrono::Duration::seconds(301)));

        // Second: 600s
        governor.record_rate_limited_at("aero-api", None, now);
        assert!(governor.is_blocked_at("aero-api", now + chrono::Duration::seconds(599)));

        // Many more: capped at 3600s
        for _ in 0..10 {
            governor.record_rate_limited_at("aero-api", None, now);
        }
        assert!(governor.is_blocked_at("aero-api", now + chrono::Duration::seconds(3599)));
        assert!(!governor.is_blocked_at("aero-api", now + chrono::Duration::seconds(3601)));
    }

    #[test]
    fn success_resets_failures() {
        let governor = RateLimitGovernor::new();
        let now = Utc::now();
        governor.record_rate_limited_at("commercial-network", None, now);
        governor.record_success("commercial-network");

        assert!(!governor.is_blocked_at("commercial-network", now));
        // Next 429 starts over at the base delay
        governor.record_rate_limited_at("commercial-network", None, now);
        assert!(!governor.is_blocked_at("commercial-network", now + chrono::Duration::seconds(301)));
    }

    #[test]
    fn daily_budget_blocks_until_the_next_day() {
        let governor = RateLimitGovernor::new();
        governor.set_daily_budget("aero-api", Some(2));
        let now = Utc::now();

        assert!(governor.record_request_at("aero-api", now));
        assert!(governor.record_request_at("aero-api", now));
        assert!(!governor.record_request_at("aero-api", now));
        assert!(governor.is_blocked_at("aero-api", now));

        // The counter resets with the UTC day
        let tomorrow = now + chrono::Duration::days(1);
        assert!(governor.record_request_at("aero-api", tomorrow));
        assert!(!governor.is_blocked_at("aero-api", tomorrow));
    }

    #[test]
    fn transport_failures_block_only_after_repeats() {
        let governor = RateLimitGovernor::new();
        let now = Utc::now();

        governor.record_failure_at("free-network", now);
        governor.record_failure_at("free-network", now);
        assert!(!governor.is_blocked_at("free-network", now));

        governor.record_failure_at("free-network", now);
        assert!(governor.is_blocked_at("free-network", now + chrono::Duration::seconds(29)));
    }
}
