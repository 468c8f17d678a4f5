//! In-process hot map of the latest accepted state per aircraft.
//!
//! The cache is authoritative for freshness only; the priority store remains
//! the source of truth. Writers go store-first, then here, so readers never
//! observe an entry the store has not accepted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aircraft_states::AircraftState;
use crate::config::LiveStateConfig;
use crate::geo::BoundingBox;

#[derive(Debug, Clone)]
struct CacheEntry {
    state: AircraftState,
    updated_at_ms: i64,
}

struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    ttl_ms: i64,
    max_entries: usize,
    cleanup_interval: Duration,
    cancel: CancellationToken,
}

/// TTL+LRU cache keyed by icao24, with an O(n) bounding-box scan.
#[derive(Clone)]
pub struct LiveStateCache {
    inner: Arc<CacheInner>,
}

impl LiveStateCache {
    pub fn new(config: &LiveStateConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                ttl_ms: (config.ttl_seconds as i64) * 1000,
                max_entries: config.max_entries,
                cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the periodic sweep so expired entries are pruned even when no
    /// scan is running. Returns the sweeper handle.
    pub fn start(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let interval = self.inner.cleanup_interval;
        info!(
            interval_seconds = interval.as_secs(),
            "Starting live-state cache sweeper"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cache.inner.cancel.cancelled() => {
                        info!("Live-state cache sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let removed = cache.sweep_at(Utc::now().timestamp_millis());
                        if removed > 0 {
                            debug!(removed, "Live-state cache sweep pruned expired entries");
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// O(1) write-through. Over capacity, the single entry with the oldest
    /// update time is evicted.
    pub fn upsert(&self, state: AircraftState) {
        self.upsert_at(state, Utc::now().timestamp_millis());
    }

    fn upsert_at(&self, state: AircraftState, now_ms: i64) {
        let key = state.icao24.clone();
        self.inner.entries.insert(
            key,
            CacheEntry {
                state,
                updated_at_ms: now_ms,
            },
        );

        if self.inner.entries.len() > self.inner.max_entries {
            self.evict_oldest();
        }

        metrics::gauge!("live_state_cache.entries").set(self.inner.entries.len() as f64);
    }

    fn evict_oldest(&self) {
        let oldest = self
            .inner
            .entries
            .iter()
            .min_by_key(|entry| entry.value().updated_at_ms)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.inner.entries.remove(&key);
            metrics::counter!("live_state_cache.evictions").increment(1);
        }
    }

    /// Fetch one entry, expiring it if its TTL has lapsed.
    pub fn get(&self, icao24: &str) -> Option<AircraftState> {
        self.get_at(icao24, Utc::now().timestamp_millis())
    }

    fn get_at(&self, icao24: &str, now_ms: i64) -> Option<AircraftState> {
        let expired = match self.inner.entries.get(icao24) {
            Some(entry) => {
                if now_ms - entry.value().updated_at_ms <= self.inner.ttl_ms {
                    metrics::counter!("live_state_cache.hits").increment(1);
                    return Some(entry.value().state.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            self.inner.entries.remove(icao24);
            metrics::counter!("live_state_cache.expired").increment(1);
        }
        metrics::counter!("live_state_cache.misses").increment(1);
        None
    }

    /// Walk all entries, deleting the expired, and return those inside the
    /// rectangle with `last_contact >= min_last_contact`.
    pub fn bounds_scan(&self, bbox: &BoundingBox, min_last_contact: i64) -> Vec<AircraftState> {
        self.bounds_scan_at(bbox, min_last_contact, Utc::now().timestamp_millis())
    }

    fn bounds_scan_at(
        &self,
        bbox: &BoundingBox,
        min_last_contact: i64,
        now_ms: i64,
    ) -> Vec<AircraftState> {
        let mut expired = Vec::new();
        let mut results = Vec::new();

        for entry in self.inner.entries.iter() {
            let cached = entry.value();
            if now_ms - cached.updated_at_ms > self.inner.ttl_ms {
                expired.push(entry.key().clone());
                continue;
            }
            let (Some(lat), Some(lon)) = (cached.state.latitude, cached.state.longitude) else {
                continue;
            };
            if !bbox.contains(lat, lon) {
                continue;
            }
            if cached.state.last_contact < min_last_contact {
                continue;
            }
            results.push(cached.state.clone());
        }

        for key in &expired {
            self.inner.entries.remove(key);
        }
        if !expired.is_empty() {
            metrics::counter!("live_state_cache.expired").increment(expired.len() as u64);
            metrics::gauge!("live_state_cache.entries").set(self.inner.entries.len() as f64);
        }

        results
    }

    /// Prune expired entries; returns how many were removed.
    fn sweep_at(&self, now_ms: i64) -> usize {
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| now_ms - entry.updated_at_ms <= self.inner.ttl_ms);
        let removed = before - self.inner.entries.len();
        if removed > 0 {
            metrics::counter!("live_state_cache.expired").increment(removed as u64);
        }
        metrics::gauge!("live_state_cache.entries").set(self.inner.entries.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft_states::DataSource;

    fn config(max_entries: usize, ttl_seconds: u64) -> LiveStateConfig {
        LiveStateConfig {
            enabled: true,
            ttl_seconds,
            max_entries,
            cleanup_interval_seconds: 30,
            min_results_before_db_fallback: 50,
        }
    }

    fn state(icao24: &str, lat: f64, lon: f64, last_contact: i64) -> AircraftState {
        AircraftState {
            icao24: icao24.to_string(),
            callsign: None,
            registration: None,
            latitude: Some(lat),
            longitude: Some(lon),
            baro_altitude: Some(10_000.0),
            geo_altitude: None,
            velocity: Some(200.0),
            true_track: Some(90.0),
            vertical_rate: None,
            on_ground: false,
            squawk: None,
            emergency_status: None,
            category: Some(3),
            aircraft_type: None,
            aircraft_description: None,
            data_source: DataSource::FreeNetwork,
            source_priority: 30,
            time_position: Some(last_contact),
            last_contact,
            ingestion_timestamp: Utc::now(),
        }
    }

    #[test]
    fn upsert_then_get() {
        let cache = LiveStateCache::new(&config(10, 120));
        cache.upsert_at(state("a1b2c3", 40.0, -74.0, 1000), 0);
        let fetched = cache.get_at("a1b2c3", 1000).unwrap();
        assert_eq!(fetched.icao24, "a1b2c3");
    }

    #[test]
    fn get_expires_stale_entry() {
        let cache = LiveStateCache::new(&config(10, 120));
        cache.upsert_at(state("a1b2c3", 40.0, -74.0, 1000), 0);
        assert!(cache.get_at("a1b2c3", 120_001).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_removes_oldest_update() {
        let cache = LiveStateCache::new(&config(2, 120));
        cache.upsert_at(state("aaaaaa", 40.0, -74.0, 1000), 0);
        cache.upsert_at(state("bbbbbb", 40.0, -74.0, 1000), 100);
        cache.upsert_at(state("cccccc", 40.0, -74.0, 1000), 200);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("aaaaaa", 250).is_none());
        assert!(cache.get_at("bbbbbb", 250).is_some());
        assert!(cache.get_at("cccccc", 250).is_some());
    }

    #[test]
    fn bounds_scan_filters_rect_freshness_and_ttl() {
        let cache = LiveStateCache::new(&config(100, 120));
        cache.upsert_at(state("inside", 40.0, -74.0, 2000), 0);
        cache.upsert_at(state("outsid", 50.0, -74.0, 2000), 0);
        cache.upsert_at(state("oldcon", 40.5, -74.5, 500), 0);
        cache.upsert_at(state("expire", 40.5, -73.5, 2000), -200_000);

        let bbox = BoundingBox::new(39.0, -75.0, 41.0, -73.0).unwrap();
        let results = cache.bounds_scan_at(&bbox, 1000, 1000);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].icao24, "inside");
        // The expired entry was deleted during the scan
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn bounds_scan_skips_positionless_states() {
        let cache = LiveStateCache::new(&config(100, 120));
        let mut no_pos = state("nopos1", 0.0, 0.0, 2000);
        no_pos.latitude = None;
        no_pos.longitude = None;
        cache.upsert_at(no_pos, 0);

        let bbox = BoundingBox::new(-10.0, -10.0, 10.0, 10.0).unwrap();
        assert!(cache.bounds_scan_at(&bbox, 0, 0).is_empty());
    }

    #[test]
    fn sweep_prunes_expired() {
        let cache = LiveStateCache::new(&config(100, 120));
        cache.upsert_at(state("aaaaaa", 40.0, -74.0, 1000), 0);
        cache.upsert_at(state("bbbbbb", 40.0, -74.0, 1000), 100_000);
        assert_eq!(cache.sweep_at(130_000), 1);
        assert_eq!(cache.len(), 1);
    }
}
