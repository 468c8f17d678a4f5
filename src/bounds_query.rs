//! Bounds query planner: merge cache and store, join routes, flag staleness,
//! snap landed aircraft, and hand survivors to the predictor.
//!
//! Everything here is read-only and idempotent; this is the only place
//! state is joined with routes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::aircraft_states::AircraftState;
use crate::aircraft_states_repo::AircraftStatesRepository;
use crate::geo::BoundingBox;
use crate::live_state_cache::LiveStateCache;
use crate::routes::{Route, RouteInfo};
use crate::routes_repo::RoutesRepository;
use crate::trajectory;

/// Entries older than this are flagged stale; on-ground entries older than
/// this are dropped outright.
pub const STALE_AFTER_SECONDS: i64 = 900;

/// What map clients receive per aircraft.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedAircraft {
    #[serde(flatten)]
    pub state: AircraftState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteInfo>,
    pub is_stale: bool,
    pub predicted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

pub struct BoundsQueryPlanner {
    cache: Option<LiveStateCache>,
    store: AircraftStatesRepository,
    routes: RoutesRepository,
    min_results_before_db_fallback: usize,
    recent_contact_threshold_seconds: u64,
}

impl BoundsQueryPlanner {
    pub fn new(
        cache: Option<LiveStateCache>,
        store: AircraftStatesRepository,
        routes: RoutesRepository,
        min_results_before_db_fallback: usize,
        recent_contact_threshold_seconds: u64,
    ) -> Self {
        Self {
            cache,
            store,
            routes,
            min_results_before_db_fallback,
            // The 30-minute cap holds no matter what configuration says
            recent_contact_threshold_seconds: recent_contact_threshold_seconds
                .min(crate::config::RECENT_CONTACT_THRESHOLD_CAP_SECONDS),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_aircraft_in_bounds(&self, bbox: BoundingBox) -> Result<Vec<EnrichedAircraft>> {
        if bbox.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let min_last_contact = now.timestamp() - self.recent_contact_threshold_seconds as i64;

        let cache_rows = match &self.cache {
            Some(cache) => cache.bounds_scan(&bbox, min_last_contact),
            None => Vec::new(),
        };

        // Skip the store entirely when the cache alone is conclusive
        let store_rows = if self.cache.is_some() && cache_rows.len() >= self.min_results_before_db_fallback
        {
            metrics::counter!("bounds_query.cache_only").increment(1);
            Vec::new()
        } else {
            metrics::counter!("bounds_query.store_fallback").increment(1);
            self.store.find_in_bounds(bbox, min_last_contact).await?
        };

        let merged = merge_states(cache_rows, store_rows);
        debug!(candidates = merged.len(), "Merged bounds candidates");

        let mut results = Vec::with_capacity(merged.len());
        for state in merged {
            let key = Route::key_for(state.callsign.as_deref(), &state.icao24);
            let route = self.routes.get(&key).await;
            if let Some(enriched) = enrich(state, route.as_ref(), now) {
                results.push(enriched);
            }
        }

        Ok(results)
    }

    /// One aircraft by icao24 or callsign, through the same enrichment.
    pub async fn get_aircraft(&self, identifier: &str) -> Result<Option<EnrichedAircraft>> {
        let Some(state) = self.store.get_by_identifier(identifier).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        let key = Route::key_for(state.callsign.as_deref(), &state.icao24);
        let route = self.routes.get(&key).await;
        Ok(enrich(state, route.as_ref(), now))
    }
}

/// Merge cache and store rows per icao24, keeping whichever has the higher
/// `last_contact`.
pub fn merge_states(
    cache_rows: Vec<AircraftState>,
    store_rows: Vec<AircraftState>,
) -> Vec<AircraftState> {
    let mut by_icao: HashMap<String, AircraftState> = HashMap::with_capacity(cache_rows.len());
    for state in cache_rows.into_iter().chain(store_rows) {
        match by_icao.get(&state.icao24) {
            Some(existing) if existing.last_contact >= state.last_contact => {}
            _ => {
                by_icao.insert(state.icao24.clone(), state);
            }
        }
    }
    by_icao.into_values().collect()
}

/// Steps 5..8 of the planner: staleness flag, landed drop/snap, prediction.
/// Returns `None` when the entry should be dropped from the response.
pub fn enrich(
    mut state: AircraftState,
    route: Option<&Route>,
    now: DateTime<Utc>,
) -> Option<EnrichedAircraft> {
    let age = state.contact_age_seconds(now);
    let is_stale = age > STALE_AFTER_SECONDS;

    // On-ground and long silent: it has landed and is noise on a live map
    if state.on_ground && is_stale {
        return None;
    }

    // Snap aircraft whose route says the flight is over to the arrival
    // airport; position data that old is wherever the plane taxied from.
    if let Some(route) = route
        && route.has_arrived(now)
        && let (Some(arr_lat), Some(arr_lon)) = (route.arrival_latitude, route.arrival_longitude)
    {
        state.latitude = Some(arr_lat);
        state.longitude = Some(arr_lon);
        state.velocity = Some(0.0);
        state.vertical_rate = None;
        state.on_ground = true;
        return Some(EnrichedAircraft {
            route: Some(RouteInfo::from(route)),
            is_stale,
            predicted: false,
            confidence: None,
            state,
        });
    }

    let prediction = trajectory::predict(&state, route, now);
    let (predicted, confidence) = match prediction {
        Some(p) => {
            state.latitude = Some(p.latitude);
            state.longitude = Some(p.longitude);
            if p.baro_altitude.is_some() {
                state.baro_altitude = p.baro_altitude;
            }
            (true, Some(p.confidence))
        }
        None => (false, None),
    };

    Some(EnrichedAircraft {
        route: route.map(RouteInfo::from),
        is_stale,
        predicted,
        confidence,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft_states::DataSource;
    use uuid::Uuid;

    fn state(icao24: &str, last_contact: i64) -> AircraftState {
        AircraftState {
            icao24: icao24.to_string(),
            callsign: Some("UAL123".to_string()),
            registration: None,
            latitude: Some(40.7),
            longitude: Some(-74.0),
            baro_altitude: Some(10_000.0),
            geo_altitude: None,
            velocity: Some(230.0),
            true_track: Some(270.0),
            vertical_rate: None,
            on_ground: false,
            squawk: None,
            emergency_status: None,
            category: Some(4),
            aircraft_type: None,
            aircraft_description: None,
            data_source: DataSource::CommercialNetwork,
            source_priority: 20,
            time_position: Some(last_contact),
            last_contact,
            ingestion_timestamp: Utc::now(),
        }
    }

    fn arrived_route(now: DateTime<Utc>) -> Route {
        Route {
            id: Uuid::new_v4(),
            flight_key: "UAL123".to_string(),
            callsign: Some("UAL123".to_string()),
            icao24: None,
            departure_icao: Some("KORD".to_string()),
            departure_iata: None,
            departure_name: None,
            departure_latitude: Some(41.9742),
            departure_longitude: Some(-87.9073),
            arrival_icao: Some("KEWR".to_string()),
            arrival_iata: Some("EWR".to_string()),
            arrival_name: Some("Newark Liberty Intl".to_string()),
            arrival_latitude: Some(40.692),
            arrival_longitude: Some(-74.169),
            scheduled_departure: None,
            actual_departure: None,
            scheduled_arrival: None,
            actual_arrival: Some(now - chrono::Duration::seconds(900)),
            aircraft_type: None,
            progress_percent: Some(100),
            flight_status: None,
            updated_at: now,
        }
    }

    #[test]
    fn merge_keeps_freshest_per_aircraft() {
        let cache = vec![state("aaaaaa", 2000), state("bbbbbb", 1000)];
        let store = vec![state("aaaaaa", 1500), state("cccccc", 1200)];

        let merged = merge_states(cache, store);
        assert_eq!(merged.len(), 3);
        let by_key: HashMap<_, _> = merged
            .into_iter()
            .map(|s| (s.icao24.clone(), s.last_contact))
            .collect();
        assert_eq!(by_key["aaaaaa"], 2000);
        assert_eq!(by_key["bbbbbb"], 1000);
        assert_eq!(by_key["cccccc"], 1200);
    }

    #[test]
    fn fresh_entry_passes_through_unchanged() {
        let now = Utc::now();
        let enriched = enrich(state("aaaaaa", now.timestamp() - 10), None, now).unwrap();
        assert!(!enriched.is_stale);
        assert!(!enriched.predicted);
        assert_eq!(enriched.state.latitude, Some(40.7));
    }

    #[test]
    fn old_entries_are_flagged_stale() {
        let now = Utc::now();
        let enriched = enrich(state("aaaaaa", now.timestamp() - 1200), None, now).unwrap();
        assert!(enriched.is_stale);
    }

    #[test]
    fn landed_on_ground_entries_are_dropped() {
        let now = Utc::now();
        let mut grounded = state("aaaaaa", now.timestamp() - 1200);
        grounded.on_ground = true;
        assert!(enrich(grounded, None, now).is_none());

        // Recent on-ground traffic stays visible
        let mut taxiing = state("bbbbbb", now.timestamp() - 60);
        taxiing.on_ground = true;
        assert!(enrich(taxiing, None, now).is_some());
    }

    #[test]
    fn arrived_flight_snaps_to_arrival_airport() {
        let now = Utc::now();
        let route = arrived_route(now);
        let stale = state("aaaaaa", now.timestamp() - 1200);

        let enriched = enrich(stale, Some(&route), now).unwrap();
        assert_eq!(enriched.state.latitude, Some(40.692));
        assert_eq!(enriched.state.longitude, Some(-74.169));
        assert_eq!(enriched.state.velocity, Some(0.0));
        assert!(enriched.state.on_ground);
        assert!(enriched.is_stale);
        assert!(!enriched.predicted);
    }

    #[test]
    fn stale_airborne_entries_get_predictions() {
        let now = Utc::now();
        let enriched = enrich(state("aaaaaa", now.timestamp() - 180), None, now).unwrap();
        assert!(enriched.predicted);
        assert!(enriched.confidence.unwrap() >= 0.5);
        // Flying west at 230 m/s for 180s moves the position
        assert!(enriched.state.longitude.unwrap() < -74.0);
    }
}
