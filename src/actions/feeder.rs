use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::json_error;
use crate::aircraft_states::{AircraftState, DataSource, validate_state};
use crate::ingest_queue::StateMessage;
use crate::web::AppState;

/// What a self-hosted feeder pushes. Canonical units are the feeder's
/// responsibility; this endpoint only validates and queues.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeederState {
    pub icao24: String,
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default)]
    pub registration: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub baro_altitude: Option<f64>,
    #[serde(default)]
    pub geo_altitude: Option<f64>,
    #[serde(default)]
    pub velocity: Option<f64>,
    #[serde(default)]
    pub true_track: Option<f64>,
    #[serde(default)]
    pub vertical_rate: Option<f64>,
    #[serde(default)]
    pub on_ground: bool,
    #[serde(default)]
    pub squawk: Option<String>,
    #[serde(default)]
    pub category: Option<i32>,
    #[serde(default)]
    pub time_position: Option<i64>,
    #[serde(default)]
    pub last_contact: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct FeederPush {
    pub states: Vec<FeederState>,
}

/// POST /feeder/aircraft: authenticated push from self-hosted feeders.
/// 202 when queued, 503 when backpressured, 401 without a valid token.
pub async fn push_feeder_aircraft(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::extract::Json<FeederPush>,
) -> axum::response::Response {
    if !authorized(&headers, &state.feeder_tokens) {
        return json_error(StatusCode::UNAUTHORIZED, "invalid feeder token").into_response();
    }

    let Some(queue) = &state.ingest_queue else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "ingestion disabled").into_response();
    };
    if queue.is_backpressured() {
        metrics::counter!("feeder.backpressured").increment(1);
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "ingestion backlogged").into_response();
    }

    let now = Utc::now();
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut messages = Vec::with_capacity(body.states.len());

    for feeder_state in &body.states {
        let mut aircraft = to_aircraft_state(feeder_state, now.timestamp());
        match validate_state(&mut aircraft) {
            Ok(()) => {
                accepted += 1;
                messages.push(StateMessage {
                    source: aircraft.data_source,
                    source_priority: aircraft.source_priority,
                    ingestion_timestamp: now,
                    retries: 0,
                    available_at: now.timestamp_millis(),
                    skip_history: false,
                    state: aircraft,
                });
            }
            Err(failure) => {
                rejected += 1;
                debug!("Rejected feeder state: {}", failure);
            }
        }
    }

    metrics::counter!("feeder.states_accepted").increment(accepted as u64);
    metrics::counter!("feeder.states_rejected").increment(rejected as u64);
    queue.enqueue_batch(messages);

    (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": accepted, "rejected": rejected })),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap, tokens: &[String]) -> bool {
    let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };
    tokens.iter().any(|known| known == token)
}

fn to_aircraft_state(feeder: &FeederState, now_secs: i64) -> AircraftState {
    AircraftState {
        icao24: feeder.icao24.clone(),
        callsign: feeder.callsign.clone(),
        registration: feeder.registration.clone(),
        latitude: feeder.latitude,
        longitude: feeder.longitude,
        baro_altitude: feeder.baro_altitude,
        geo_altitude: feeder.geo_altitude,
        velocity: feeder.velocity,
        true_track: feeder.true_track,
        vertical_rate: feeder.vertical_rate,
        on_ground: feeder.on_ground,
        squawk: feeder.squawk.clone(),
        emergency_status: None,
        category: feeder.category,
        aircraft_type: None,
        aircraft_description: None,
        data_source: DataSource::Feeder,
        source_priority: DataSource::Feeder.priority(),
        time_position: feeder.time_position,
        last_contact: feeder.last_contact.unwrap_or(now_secs),
        ingestion_timestamp: Utc::now(),
    }
}
