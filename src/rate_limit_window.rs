//! Sliding-window request counters, keyed by `(subscriber, scope)`.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct Window {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// Over budget until the window resets.
    Limited { reset_at: DateTime<Utc> },
}

/// In-process sliding windows. The registry is injected wherever budget is
/// enforced, so a shared fast store can replace it without touching callers.
pub struct RateLimitWindows {
    windows: DashMap<String, Window>,
    window_length: Duration,
}

impl RateLimitWindows {
    pub fn new(window_length: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window_length,
        }
    }

    pub fn per_minute() -> Self {
        Self::new(Duration::seconds(60))
    }

    /// Count one request against the key's budget. Returns `Limited` with
    /// the reset time when the budget is exhausted.
    pub fn check(&self, key: &str, limit: u32) -> RateDecision {
        self.check_at(key, limit, Utc::now())
    }

    fn check_at(&self, key: &str, limit: u32, now: DateTime<Utc>) -> RateDecision {
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            window_start: now,
        });

        if now - window.window_start >= self.window_length {
            window.count = 0;
            window.window_start = now;
        }

        if window.count >= limit {
            return RateDecision::Limited {
                reset_at: window.window_start + self.window_length,
            };
        }

        window.count += 1;
        RateDecision::Allowed
    }

    /// Drop windows that have fully lapsed; called opportunistically.
    pub fn prune(&self) {
        let now = Utc::now();
        self.windows
            .retain(|_, window| now - window.window_start < self.window_length * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_limits() {
        let windows = RateLimitWindows::per_minute();
        let now = Utc::now();

        for _ in 0..3 {
            assert_eq!(windows.check_at("sub-1", 3, now), RateDecision::Allowed);
        }
        match windows.check_at("sub-1", 3, now) {
            RateDecision::Limited { reset_at } => {
                assert_eq!(reset_at, now + Duration::seconds(60));
            }
            RateDecision::Allowed => panic!("should be limited"),
        }
    }

    #[test]
    fn budget_resets_after_window() {
        let windows = RateLimitWindows::per_minute();
        let now = Utc::now();

        for _ in 0..3 {
            windows.check_at("sub-1", 3, now);
        }
        assert!(matches!(
            windows.check_at("sub-1", 3, now),
            RateDecision::Limited { .. }
        ));

        let later = now + Duration::seconds(61);
        assert_eq!(windows.check_at("sub-1", 3, later), RateDecision::Allowed);
    }

    #[test]
    fn keys_are_independent() {
        let windows = RateLimitWindows::per_minute();
        let now = Utc::now();

        windows.check_at("sub-1", 1, now);
        assert!(matches!(
            windows.check_at("sub-1", 1, now),
            RateDecision::Limited { .. }
        ));
        assert_eq!(windows.check_at("sub-2", 1, now), RateDecision::Allowed);
    }
}
