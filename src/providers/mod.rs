//! Provider adapters. Each adapter owns its upstream's request and response
//! shapes; nothing outside this module knows how a provider spells a field.
//! Adapters never error to their callers: a failed fetch is an empty batch,
//! logged here and recorded with the rate-limit governor.

pub mod aero_api;
pub mod commercial_network;
pub mod free_network;
pub mod units;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::aircraft_states::{AircraftState, DataSource};
use crate::geo::BoundingBox;
use crate::rate_limit_governor::RateLimitGovernor;
use crate::routes::Route;

/// Everything one fetch yields. Routes are only populated by providers
/// that carry them.
#[derive(Debug, Default)]
pub struct ProviderBatch {
    pub states: Vec<AircraftState>,
    pub routes: Vec<Route>,
}

impl ProviderBatch {
    pub fn from_states(states: Vec<AircraftState>) -> Self {
        Self {
            states,
            routes: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn source(&self) -> DataSource;

    /// Fetch every state the provider will give us.
    async fn fetch_all(&self) -> ProviderBatch;

    /// Fetch states inside a bounding box.
    async fn fetch_bounds(&self, bbox: &BoundingBox) -> ProviderBatch;
}

/// Retry ceiling for 5xx and transport failures within one fetch.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff base between in-fetch retries.
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Request timeout; anything slower is treated as an empty result.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared fetch policy: consult the governor, retry 5xx/transport errors
/// with exponential backoff, hand 429s to the governor, and give up quietly.
/// Returns `None` whenever the caller should treat the fetch as empty.
pub(crate) async fn execute_with_retry(
    provider: &'static str,
    governor: &RateLimitGovernor,
    build_request: impl Fn() -> reqwest::RequestBuilder,
) -> Option<reqwest::Response> {
    if governor.is_blocked(provider) {
        debug!(
            provider,
            blocked_for = ?governor.blocked_for(provider),
            "Skipping fetch, provider is blocked"
        );
        return None;
    }
    if !governor.record_request(provider) {
        debug!(provider, "Daily budget spent, skipping fetch");
        return None;
    }

    for attempt in 1..=MAX_ATTEMPTS {
        match build_request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    governor.record_success(provider);
                    return Some(response);
                }

                if status.as_u16() == 429 {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    governor.record_rate_limited(provider, retry_after);
                    return None;
                }

                if status.is_server_error() {
                    warn!(
                        provider,
                        attempt,
                        status = status.as_u16(),
                        "Provider returned server error"
                    );
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt - 1)).await;
                        continue;
                    }
                    governor.record_failure(provider);
                    return None;
                }

                // Other 4xx: our request is wrong, retrying will not help
                error!(
                    provider,
                    status = status.as_u16(),
                    "Provider rejected request"
                );
                governor.record_failure(provider);
                return None;
            }
            Err(e) => {
                warn!(provider, attempt, error = %e, "Provider request failed");
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt - 1)).await;
                    continue;
                }
                governor.record_failure(provider);
                return None;
            }
        }
    }

    None
}

/// Parse a JSON body, logging and counting decode failures.
pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    provider: &'static str,
    response: reqwest::Response,
) -> Option<T> {
    match response.json::<T>().await {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            error!(provider, error = %e, "Failed to decode provider response");
            metrics::counter!(format!("provider.{}.decode_errors", provider)).increment(1);
            None
        }
    }
}
