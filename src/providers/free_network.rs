//! Adapter for the free global surveillance network.
//!
//! The upstream speaks positional JSON arrays; the index-to-field mapping
//! lives here and nowhere else. Units are already canonical (meters, m/s,
//! Unix seconds), so no conversions apply beyond category coercion.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::aircraft_states::{
    AircraftState, DataSource, coerce_category, normalize_callsign, normalize_icao24,
};
use crate::config::ProviderConfig;
use crate::geo::BoundingBox;
use crate::providers::{
    ProviderAdapter, ProviderBatch, REQUEST_TIMEOUT, decode_json, execute_with_retry,
};
use crate::rate_limit_governor::RateLimitGovernor;
use std::sync::Arc;

const PROVIDER_NAME: &str = "free-network";

/// Positional indices of one state vector in the upstream response.
const IDX_ICAO24: usize = 0;
const IDX_CALLSIGN: usize = 1;
const IDX_TIME_POSITION: usize = 3;
const IDX_LAST_CONTACT: usize = 4;
const IDX_LONGITUDE: usize = 5;
const IDX_LATITUDE: usize = 6;
const IDX_BARO_ALTITUDE: usize = 7;
const IDX_ON_GROUND: usize = 8;
const IDX_VELOCITY: usize = 9;
const IDX_TRUE_TRACK: usize = 10;
const IDX_VERTICAL_RATE: usize = 11;
const IDX_GEO_ALTITUDE: usize = 13;
const IDX_SQUAWK: usize = 14;
const IDX_CATEGORY: usize = 17;

#[derive(Debug, Deserialize)]
struct StatesResponse {
    #[allow(dead_code)]
    time: Option<i64>,
    states: Option<Vec<Vec<Value>>>,
}

pub struct FreeNetworkAdapter {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
    governor: Arc<RateLimitGovernor>,
}

impl FreeNetworkAdapter {
    pub fn new(config: &ProviderConfig, governor: Arc<RateLimitGovernor>) -> Self {
        let credentials = config.credentials.as_deref().and_then(|raw| {
            raw.split_once(':')
                .map(|(user, pass)| (user.to_string(), pass.to_string()))
        });

        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://opensky-network.org/api".to_string()),
            credentials,
            governor,
        }
    }

    fn request(&self, query: &[(&str, String)]) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .get(format!("{}/states/all", self.base_url))
            .query(&[("extended", "1")])
            .query(query);
        if let Some((user, pass)) = &self.credentials {
            builder = builder.basic_auth(user, Some(pass));
        }
        builder
    }

    async fn fetch(&self, query: Vec<(&'static str, String)>) -> ProviderBatch {
        let Some(response) =
            execute_with_retry(PROVIDER_NAME, &self.governor, || self.request(&query)).await
        else {
            return ProviderBatch::default();
        };

        let Some(decoded) = decode_json::<StatesResponse>(PROVIDER_NAME, response).await else {
            return ProviderBatch::default();
        };

        let vectors = decoded.states.unwrap_or_default();
        let mut states = Vec::with_capacity(vectors.len());
        let mut skipped = 0usize;
        for vector in &vectors {
            match parse_state_vector(vector) {
                Some(state) => states.push(state),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            debug!(skipped, "Dropped unparseable state vectors");
        }
        metrics::counter!("provider.free-network.states_fetched").increment(states.len() as u64);
        ProviderBatch::from_states(states)
    }
}

#[async_trait]
impl ProviderAdapter for FreeNetworkAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn source(&self) -> DataSource {
        DataSource::FreeNetwork
    }

    #[instrument(skip(self))]
    async fn fetch_all(&self) -> ProviderBatch {
        self.fetch(Vec::new()).await
    }

    #[instrument(skip(self))]
    async fn fetch_bounds(&self, bbox: &BoundingBox) -> ProviderBatch {
        self.fetch(vec![
            ("lamin", bbox.lat_min.to_string()),
            ("lomin", bbox.lon_min.to_string()),
            ("lamax", bbox.lat_max.to_string()),
            ("lomax", bbox.lon_max.to_string()),
        ])
        .await
    }
}

fn get_f64(vector: &[Value], idx: usize) -> Option<f64> {
    vector.get(idx).and_then(Value::as_f64)
}

fn get_str(vector: &[Value], idx: usize) -> Option<&str> {
    vector.get(idx).and_then(Value::as_str)
}

/// One positional state vector into a canonical state. Vectors without a
/// valid icao24 are dropped.
fn parse_state_vector(vector: &[Value]) -> Option<AircraftState> {
    let icao24 = normalize_icao24(get_str(vector, IDX_ICAO24)?).ok()?;
    let last_contact = vector.get(IDX_LAST_CONTACT).and_then(Value::as_i64)?;

    Some(AircraftState {
        icao24,
        callsign: normalize_callsign(get_str(vector, IDX_CALLSIGN)),
        registration: None,
        latitude: get_f64(vector, IDX_LATITUDE),
        longitude: get_f64(vector, IDX_LONGITUDE),
        baro_altitude: get_f64(vector, IDX_BARO_ALTITUDE),
        geo_altitude: get_f64(vector, IDX_GEO_ALTITUDE),
        velocity: get_f64(vector, IDX_VELOCITY),
        true_track: get_f64(vector, IDX_TRUE_TRACK),
        vertical_rate: get_f64(vector, IDX_VERTICAL_RATE),
        on_ground: vector
            .get(IDX_ON_GROUND)
            .and_then(Value::as_bool)
            .unwrap_or(false),
        squawk: get_str(vector, IDX_SQUAWK).map(|s| s.to_string()),
        emergency_status: None,
        category: coerce_category(
            vector
                .get(IDX_CATEGORY)
                .and_then(Value::as_i64)
                .map(|c| c as i32),
        ),
        aircraft_type: None,
        aircraft_description: None,
        data_source: DataSource::FreeNetwork,
        source_priority: DataSource::FreeNetwork.priority(),
        time_position: vector.get(IDX_TIME_POSITION).and_then(Value::as_i64),
        last_contact,
        ingestion_timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_vector() -> Vec<Value> {
        json!([
            "A1B2C3",
            "UAL123  ",
            "United States",
            1_700_000_000,
            1_700_000_005,
            -74.0,
            40.0,
            10_668.0,
            false,
            231.5,
            270.0,
            -2.5,
            null,
            10_700.0,
            "1200",
            false,
            0,
            4
        ])
        .as_array()
        .unwrap()
        .clone()
    }

    #[test]
    fn parses_full_vector() {
        let state = parse_state_vector(&sample_vector()).unwrap();
        assert_eq!(state.icao24, "a1b2c3");
        assert_eq!(state.callsign.as_deref(), Some("UAL123"));
        assert_eq!(state.latitude, Some(40.0));
        assert_eq!(state.longitude, Some(-74.0));
        assert_eq!(state.baro_altitude, Some(10_668.0));
        assert_eq!(state.velocity, Some(231.5));
        assert_eq!(state.vertical_rate, Some(-2.5));
        assert!(!state.on_ground);
        assert_eq!(state.squawk.as_deref(), Some("1200"));
        assert_eq!(state.category, Some(4));
        assert_eq!(state.time_position, Some(1_700_000_000));
        assert_eq!(state.last_contact, 1_700_000_005);
        assert_eq!(state.source_priority, 30);
    }

    #[test]
    fn nulls_become_none() {
        let mut vector = sample_vector();
        vector[IDX_LATITUDE] = Value::Null;
        vector[IDX_LONGITUDE] = Value::Null;
        vector[IDX_VELOCITY] = Value::Null;
        let state = parse_state_vector(&vector).unwrap();
        assert_eq!(state.latitude, None);
        assert_eq!(state.velocity, None);
    }

    #[test]
    fn out_of_range_category_dropped() {
        let mut vector = sample_vector();
        vector[IDX_CATEGORY] = json!(20);
        let state = parse_state_vector(&vector).unwrap();
        assert_eq!(state.category, None);
    }

    #[test]
    fn bad_icao24_drops_vector() {
        let mut vector = sample_vector();
        vector[IDX_ICAO24] = json!("nothex");
        assert!(parse_state_vector(&vector).is_none());

        let mut vector = sample_vector();
        vector[IDX_ICAO24] = Value::Null;
        assert!(parse_state_vector(&vector).is_none());
    }

    #[test]
    fn short_vector_without_category() {
        let mut vector = sample_vector();
        vector.truncate(17);
        let state = parse_state_vector(&vector).unwrap();
        assert_eq!(state.category, None);
    }
}
