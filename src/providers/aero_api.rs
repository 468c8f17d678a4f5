//! Adapter for the paid AeroAPI.
//!
//! The only provider that carries route legs: each flight yields both a
//! canonical state and a route annotation. Altitudes arrive in hundreds of
//! feet and speeds in knots; conversions happen here. Flights without a
//! transponder hex cannot be keyed and are skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::aircraft_states::{AircraftState, DataSource, normalize_callsign, normalize_icao24};
use crate::config::ProviderConfig;
use crate::geo::BoundingBox;
use crate::providers::units::{feet_to_meters, knots_to_mps, on_ground_heuristic};
use crate::providers::{
    ProviderAdapter, ProviderBatch, REQUEST_TIMEOUT, decode_json, execute_with_retry,
};
use crate::rate_limit_governor::RateLimitGovernor;
use crate::routes::Route;
use std::sync::Arc;

const PROVIDER_NAME: &str = "aero-api";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    flights: Vec<FlightJson>,
}

#[derive(Debug, Deserialize)]
struct FlightJson {
    #[serde(default)]
    ident: Option<String>,
    #[serde(default)]
    hex: Option<String>,
    #[serde(default)]
    registration: Option<String>,
    #[serde(default)]
    aircraft_type: Option<String>,
    #[serde(default)]
    origin: Option<AirportJson>,
    #[serde(default)]
    destination: Option<AirportJson>,
    #[serde(default)]
    last_position: Option<PositionJson>,
    #[serde(default)]
    progress_percent: Option<i32>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    scheduled_out: Option<DateTime<Utc>>,
    #[serde(default)]
    actual_out: Option<DateTime<Utc>>,
    #[serde(default)]
    scheduled_in: Option<DateTime<Utc>>,
    #[serde(default)]
    actual_in: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AirportJson {
    #[serde(default)]
    code_icao: Option<String>,
    #[serde(default)]
    code_iata: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PositionJson {
    /// Hundreds of feet
    #[serde(default)]
    altitude: Option<f64>,
    /// Knots
    #[serde(default)]
    groundspeed: Option<f64>,
    #[serde(default)]
    heading: Option<f64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

pub struct AeroApiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    governor: Arc<RateLimitGovernor>,
}

impl AeroApiAdapter {
    pub fn new(config: &ProviderConfig, governor: Arc<RateLimitGovernor>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://aeroapi.flightaware.com/aeroapi".to_string()),
            api_key: config.credentials.clone(),
            governor,
        }
    }

    async fn search(&self, query: String) -> ProviderBatch {
        let Some(response) = execute_with_retry(PROVIDER_NAME, &self.governor, || {
            let mut builder = self
                .client
                .get(format!("{}/flights/search", self.base_url))
                .query(&[("query", query.as_str())]);
            if let Some(key) = &self.api_key {
                builder = builder.header("x-apikey", key);
            }
            builder
        })
        .await
        else {
            return ProviderBatch::default();
        };

        let Some(decoded) = decode_json::<SearchResponse>(PROVIDER_NAME, response).await else {
            return ProviderBatch::default();
        };

        let mut batch = ProviderBatch::default();
        let mut unkeyed = 0usize;
        for flight in &decoded.flights {
            match parse_flight(flight) {
                Some((state, route)) => {
                    batch.routes.push(route);
                    batch.states.push(state);
                }
                None => unkeyed += 1,
            }
        }

        if unkeyed > 0 {
            debug!(unkeyed, "Skipped flights without a usable transponder hex");
        }
        metrics::counter!("provider.aero-api.states_fetched")
            .increment(batch.states.len() as u64);
        batch
    }
}

#[async_trait]
impl ProviderAdapter for AeroApiAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn source(&self) -> DataSource {
        DataSource::AeroApi
    }

    async fn fetch_all(&self) -> ProviderBatch {
        // Per-result billing rules out global polls; this provider is only
        // queried for explicit bounds.
        debug!("AeroAPI is never polled globally, returning empty");
        ProviderBatch::default()
    }

    #[instrument(skip(self))]
    async fn fetch_bounds(&self, bbox: &BoundingBox) -> ProviderBatch {
        let query = format!(
            "-latlong \"{} {} {} {}\"",
            bbox.lat_min, bbox.lon_min, bbox.lat_max, bbox.lon_max
        );
        self.search(query).await
    }
}

fn parse_flight(flight: &FlightJson) -> Option<(AircraftState, Route)> {
    let icao24 = normalize_icao24(flight.hex.as_deref()?).ok()?;
    let position = flight.last_position.as_ref();
    let callsign = normalize_callsign(flight.ident.as_deref());

    let timestamp = position
        .and_then(|p| p.timestamp)
        .unwrap_or_else(Utc::now)
        .timestamp();

    let altitude = position
        .and_then(|p| p.altitude)
        .map(|hundreds| feet_to_meters(hundreds * 100.0));
    let groundspeed_knots = position.and_then(|p| p.groundspeed);

    let state = AircraftState {
        icao24: icao24.clone(),
        callsign: callsign.clone(),
        registration: flight.registration.clone(),
        latitude: position.and_then(|p| p.latitude),
        longitude: position.and_then(|p| p.longitude),
        baro_altitude: altitude,
        geo_altitude: None,
        velocity: groundspeed_knots.map(knots_to_mps),
        true_track: position.and_then(|p| p.heading),
        vertical_rate: None,
        on_ground: on_ground_heuristic(altitude, groundspeed_knots),
        squawk: None,
        emergency_status: None,
        category: None,
        aircraft_type: flight.aircraft_type.clone(),
        aircraft_description: None,
        data_source: DataSource::AeroApi,
        source_priority: DataSource::AeroApi.priority(),
        time_position: Some(timestamp),
        last_contact: timestamp,
        ingestion_timestamp: Utc::now(),
    };

    let route = Route {
        id: Uuid::new_v4(),
        flight_key: Route::key_for(callsign.as_deref(), &icao24),
        callsign,
        icao24: Some(icao24),
        departure_icao: flight.origin.as_ref().and_then(|a| a.code_icao.clone()),
        departure_iata: flight.origin.as_ref().and_then(|a| a.code_iata.clone()),
        departure_name: flight.origin.as_ref().and_then(|a| a.name.clone()),
        departure_latitude: flight.origin.as_ref().and_then(|a| a.latitude),
        departure_longitude: flight.origin.as_ref().and_then(|a| a.longitude),
        arrival_icao: flight.destination.as_ref().and_then(|a| a.code_icao.clone()),
        arrival_iata: flight.destination.as_ref().and_then(|a| a.code_iata.clone()),
        arrival_name: flight.destination.as_ref().and_then(|a| a.name.clone()),
        arrival_latitude: flight.destination.as_ref().and_then(|a| a.latitude),
        arrival_longitude: flight.destination.as_ref().and_then(|a| a.longitude),
        scheduled_departure: flight.scheduled_out,
        actual_departure: flight.actual_out,
        scheduled_arrival: flight.scheduled_in,
        actual_arrival: flight.actual_in,
        aircraft_type: flight.aircraft_type.clone(),
        progress_percent: flight.progress_percent,
        flight_status: flight.status.clone(),
        updated_at: Utc::now(),
    };

    Some((state, route))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_flight() -> FlightJson {
        serde_json::from_value(serde_json::json!({
            "ident": "UAL123",
            "hex": "A1B2C3",
            "registration": "N12345",
            "aircraft_type": "B738",
            "origin": {
                "code_icao": "KJFK",
                "code_iata": "JFK",
                "name": "John F Kennedy Intl",
                "latitude": 40.6413,
                "longitude": -73.7781
            },
            "destination": {
                "code_icao": "KLAX",
                "code_iata": "LAX",
                "name": "Los Angeles Intl",
                "latitude": 33.9416,
                "longitude": -118.4085
            },
            "last_position": {
                "altitude": 350,
                "groundspeed": 450.0,
                "heading": 270.0,
                "latitude": 39.5,
                "longitude": -98.0,
                "timestamp": "2023-11-14T22:13:20Z"
            },
            "progress_percent": 55,
            "status": "En Route",
            "scheduled_out": "2023-11-14T19:00:00Z",
            "actual_out": "2023-11-14T19:12:00Z",
            "scheduled_in": "2023-11-15T01:10:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn parses_state_and_route() {
        let (state, route) = parse_flight(&sample_flight()).unwrap();

        assert_eq!(state.icao24, "a1b2c3");
        assert_eq!(state.callsign.as_deref(), Some("UAL123"));
        // 350 hundreds of feet = 35000 ft
        assert_eq!(state.baro_altitude, Some(feet_to_meters(35_000.0)));
        assert_eq!(state.velocity, Some(knots_to_mps(450.0)));
        assert_eq!(state.last_contact, 1_700_000_000);
        assert_eq!(state.source_priority, 40);
        assert!(!state.on_ground);

        assert_eq!(route.flight_key, "UAL123");
        assert_eq!(route.departure_icao.as_deref(), Some("KJFK"));
        assert_eq!(route.arrival_icao.as_deref(), Some("KLAX"));
        assert!(route.has_endpoints());
        assert_eq!(route.progress_percent, Some(55));
    }

    #[test]
    fn missing_hex_skips_flight() {
        let mut flight = sample_flight();
        flight.hex = None;
        assert!(parse_flight(&flight).is_none());
    }

    #[test]
    fn route_keys_by_hex_without_callsign() {
        let mut flight = sample_flight();
        flight.ident = None;
        let (_, route) = parse_flight(&flight).unwrap();
        assert_eq!(route.flight_key, "a1b2c3");
    }
}
