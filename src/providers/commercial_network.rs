//! Adapter for the rate-limited commercial network.
//!
//! The upstream serves JSON objects keyed around point queries
//! (`/lat/{lat}/lon/{lon}/dist/{nm}`) and measures in feet, knots, and
//! ft/min; all conversions to canonical units happen here. This is also the
//! provider the CONUS scanner drives, one point per second.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::aircraft_states::{
    AircraftState, DataSource, coerce_category, normalize_callsign, normalize_icao24,
};
use crate::config::ProviderConfig;
use crate::geo::{BoundingBox, haversine_meters};
use crate::providers::units::{
    emitter_category_code, feet_to_meters, fpm_to_mps, knots_to_mps, on_ground_heuristic,
};
use crate::providers::{
    ProviderAdapter, ProviderBatch, REQUEST_TIMEOUT, decode_json, execute_with_retry,
};
use crate::rate_limit_governor::RateLimitGovernor;
use std::sync::Arc;

const PROVIDER_NAME: &str = "commercial-network";

/// Point queries top out at this radius.
const MAX_RADIUS_NM: f64 = 250.0;

const METERS_PER_NM: f64 = 1852.0;

#[derive(Debug, Deserialize)]
struct PointResponse {
    #[serde(default)]
    ac: Vec<AircraftJson>,
    /// Server clock in epoch milliseconds; `seen` offsets are relative to it.
    now: i64,
}

#[derive(Debug, Deserialize)]
struct AircraftJson {
    hex: String,
    #[serde(default)]
    flight: Option<String>,
    /// Registration
    #[serde(default)]
    r: Option<String>,
    /// Type designator
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    desc: Option<String>,
    /// Feet, or the literal string "ground"
    #[serde(default)]
    alt_baro: Option<Value>,
    #[serde(default)]
    alt_geom: Option<f64>,
    /// Ground speed in knots
    #[serde(default)]
    gs: Option<f64>,
    #[serde(default)]
    track: Option<f64>,
    /// Barometric rate in ft/min
    #[serde(default)]
    baro_rate: Option<f64>,
    #[serde(default)]
    squawk: Option<String>,
    #[serde(default)]
    emergency: Option<String>,
    /// Emitter category code, e.g. "A3"
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    /// Seconds since the position was heard
    #[serde(default)]
    seen_pos: Option<f64>,
    /// Seconds since any message was heard
    #[serde(default)]
    seen: Option<f64>,
}

pub struct CommercialNetworkAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    governor: Arc<RateLimitGovernor>,
}

impl CommercialNetworkAdapter {
    pub fn new(config: &ProviderConfig, governor: Arc<RateLimitGovernor>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://adsbexchange.com/api/aircraft/v2".to_string()),
            api_key: config.credentials.clone(),
            governor,
        }
    }

    /// Fetch all aircraft within `radius_nm` of a point. The scanner calls
    /// this directly; `fetch_bounds` goes through it too.
    #[instrument(skip(self))]
    pub async fn fetch_point(&self, lat: f64, lon: f64, radius_nm: f64) -> ProviderBatch {
        let radius = radius_nm.min(MAX_RADIUS_NM).max(1.0);
        let url = format!(
            "{}/lat/{:.6}/lon/{:.6}/dist/{:.0}",
            self.base_url, lat, lon, radius
        );

        let Some(response) = execute_with_retry(PROVIDER_NAME, &self.governor, || {
            let mut builder = self.client.get(&url);
            if let Some(key) = &self.api_key {
                builder = builder.header("api-auth", key);
            }
            builder
        })
        .await
        else {
            return ProviderBatch::default();
        };

        let Some(decoded) = decode_json::<PointResponse>(PROVIDER_NAME, response).await else {
            return ProviderBatch::default();
        };

        let server_now_secs = decoded.now / 1000;
        let states: Vec<AircraftState> = decoded
            .ac
            .iter()
            .filter_map(|ac| parse_aircraft(ac, server_now_secs))
            .collect();

        metrics::counter!("provider.commercial-network.states_fetched")
            .increment(states.len() as u64);
        ProviderBatch::from_states(states)
    }
}

#[async_trait]
impl ProviderAdapter for CommercialNetworkAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn source(&self) -> DataSource {
        DataSource::CommercialNetwork
    }

    async fn fetch_all(&self) -> ProviderBatch {
        // The upstream has no global endpoint; coverage comes from the
        // scanner's point rotation instead.
        debug!("Commercial network has no fetch-all endpoint, returning empty");
        ProviderBatch::default()
    }

    async fn fetch_bounds(&self, bbox: &BoundingBox) -> ProviderBatch {
        let center_lat = (bbox.lat_min + bbox.lat_max) / 2.0;
        let center_lon = (bbox.lon_min + bbox.lon_max) / 2.0;
        let radius_m = haversine_meters(center_lat, center_lon, bbox.lat_max, bbox.lon_max);
        let radius_nm = (radius_m / METERS_PER_NM).ceil();

        let mut batch = self.fetch_point(center_lat, center_lon, radius_nm).await;
        // The point query circumscribes the rectangle; trim the corners
        batch.states.retain(|state| {
            matches!((state.latitude, state.longitude), (Some(lat), Some(lon))
                if bbox.contains(lat, lon))
        });
        batch
    }
}

fn parse_aircraft(ac: &AircraftJson, server_now_secs: i64) -> Option<AircraftState> {
    let icao24 = normalize_icao24(&ac.hex).ok()?;

    let (baro_altitude, ground_from_alt) = match &ac.alt_baro {
        Some(Value::Number(n)) => (n.as_f64().map(feet_to_meters), false),
        Some(Value::String(s)) if s == "ground" => (None, true),
        _ => (None, false),
    };

    let on_ground = ground_from_alt || on_ground_heuristic(baro_altitude, ac.gs);

    let last_contact = server_now_secs - ac.seen.unwrap_or(0.0).round() as i64;
    let time_position = ac
        .seen_pos
        .map(|seen_pos| server_now_secs - seen_pos.round() as i64);

    Some(AircraftState {
        icao24,
        callsign: normalize_callsign(ac.flight.as_deref()),
        registration: ac.r.clone(),
        latitude: ac.lat,
        longitude: ac.lon,
        baro_altitude,
        geo_altitude: ac.alt_geom.map(feet_to_meters),
        velocity: ac.gs.map(knots_to_mps),
        true_track: ac.track,
        vertical_rate: ac.baro_rate.map(fpm_to_mps),
        on_ground,
        squawk: ac.squawk.clone(),
        emergency_status: ac
            .emergency
            .clone()
            .filter(|e| !e.is_empty() && e != "none"),
        category: coerce_category(ac.category.as_deref().and_then(emitter_category_code)),
        aircraft_type: ac.t.clone(),
        aircraft_description: ac.desc.clone(),
        data_source: DataSource::CommercialNetwork,
        source_priority: DataSource::CommercialNetwork.priority(),
        time_position,
        last_contact,
        ingestion_timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_aircraft() -> AircraftJson {
        serde_json::from_value(serde_json::json!({
            "hex": "A1B2C3",
            "flight": "ual123 ",
            "r": "N12345",
            "t": "B738",
            "desc": "BOEING 737-800",
            "alt_baro": 35000,
            "alt_geom": 35500,
            "gs": 450.0,
            "track": 270.0,
            "baro_rate": -500,
            "squawk": "1200",
            "emergency": "none",
            "category": "A3",
            "lat": 40.0,
            "lon": -74.0,
            "seen_pos": 2.0,
            "seen": 1.0
        }))
        .unwrap()
    }

    #[test]
    fn converts_units_at_the_edge() {
        let state = parse_aircraft(&sample_aircraft(), 1_700_000_000).unwrap();
        assert_eq!(state.icao24, "a1b2c3");
        assert_eq!(state.callsign.as_deref(), Some("UAL123"));
        assert_eq!(state.baro_altitude, Some(35_000.0 * 0.3048));
        assert_eq!(state.geo_altitude, Some(35_500.0 * 0.3048));
        assert_eq!(state.velocity, Some(450.0 * 0.514444));
        assert_eq!(state.vertical_rate, Some(-500.0 * 0.00508));
        assert_eq!(state.category, Some(4));
        assert_eq!(state.emergency_status, None);
        assert_eq!(state.last_contact, 1_699_999_999);
        assert_eq!(state.time_position, Some(1_699_999_998));
        assert_eq!(state.source_priority, 20);
        assert!(!state.on_ground);
    }

    #[test]
    fn ground_altitude_string_means_on_ground() {
        let mut ac = sample_aircraft();
        ac.alt_baro = Some(Value::String("ground".to_string()));
        let state = parse_aircraft(&ac, 1_700_000_000).unwrap();
        assert!(state.on_ground);
        assert_eq!(state.baro_altitude, None);
    }

    #[test]
    fn heuristic_applies_when_slow() {
        let mut ac = sample_aircraft();
        ac.gs = Some(30.0);
        let state = parse_aircraft(&ac, 1_700_000_000).unwrap();
        assert!(state.on_ground);
    }

    #[test]
    fn real_emergency_is_kept() {
        let mut ac = sample_aircraft();
        ac.emergency = Some("general".to_string());
        let state = parse_aircraft(&ac, 1_700_000_000).unwrap();
        assert_eq!(state.emergency_status.as_deref(), Some("general"));
    }

    #[test]
    fn unknown_category_becomes_null() {
        let mut ac = sample_aircraft();
        ac.category = Some("C7".to_string());
        let state = parse_aircraft(&ac, 1_700_000_000).unwrap();
        assert_eq!(state.category, None);
    }

    #[test]
    fn bad_hex_is_dropped() {
        let mut ac = sample_aircraft();
        ac.hex = "~a1b2c".to_string();
        assert!(parse_aircraft(&ac, 1_700_000_000).is_none());
    }
}
