use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::json_error;
use crate::aircraft_states::normalize_icao24;
use crate::aircraft_states_repo::HistoryRow;
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// GET /history/{icao24}?from&to: flight path as GeoJSON.
pub async fn get_history(
    State(state): State<AppState>,
    Path(icao24): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> axum::response::Response {
    let hex = match normalize_icao24(&icao24) {
        Ok(hex) => hex,
        Err(failure) => {
            return json_error(StatusCode::BAD_REQUEST, &failure.to_string()).into_response();
        }
    };

    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::hours(6));
    if from > to {
        return json_error(StatusCode::BAD_REQUEST, "from is after to").into_response();
    }

    match state.store.history_range(&hex, from, to).await {
        Ok(rows) => Json(flight_path_geojson(&hex, &rows, from, to)).into_response(),
        Err(e) => {
            error!("History query failed for {}: {}", hex, e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "history query failed").into_response()
        }
    }
}

/// Build a FeatureCollection with one LineString of `[lon, lat, altitude]`
/// coordinates, oldest first. Snapshots without a position are skipped.
fn flight_path_geojson(
    icao24: &str,
    rows: &[HistoryRow],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> serde_json::Value {
    let coordinates: Vec<serde_json::Value> = rows
        .iter()
        .filter_map(|row| {
            let (lat, lon) = (row.latitude?, row.longitude?);
            Some(json!([lon, lat, row.baro_altitude.unwrap_or(0.0)]))
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "geometry": {
                "type": "LineString",
                "coordinates": coordinates,
            },
            "properties": {
                "icao24": icao24,
                "from": from.to_rfc3339(),
                "to": to.to_rfc3339(),
                "points": coordinates.len(),
            },
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft_states::DataSource;

    fn row(lat: Option<f64>, lon: Option<f64>, alt: Option<f64>) -> HistoryRow {
        HistoryRow {
            icao24: "a1b2c3".to_string(),
            created_at: Utc::now(),
            callsign: None,
            latitude: lat,
            longitude: lon,
            baro_altitude: alt,
            geo_altitude: None,
            velocity: None,
            true_track: None,
            vertical_rate: None,
            on_ground: false,
            squawk: None,
            category: None,
            data_source: DataSource::Feeder,
            source_priority: 10,
            time_position: None,
            last_contact: 1_700_000_000,
        }
    }

    #[test]
    fn geojson_line_from_positioned_rows() {
        let now = Utc::now();
        let rows = vec![
            row(Some(40.0), Some(-74.0), Some(1000.0)),
            row(None, Some(-74.1), None),
            row(Some(40.1), Some(-74.2), None),
        ];
        let geojson = flight_path_geojson("a1b2c3", &rows, now - Duration::hours(1), now);

        let coords = &geojson["features"][0]["geometry"]["coordinates"];
        assert_eq!(coords.as_array().unwrap().len(), 2);
        assert_eq!(coords[0][0], -74.0);
        assert_eq!(coords[0][1], 40.0);
        assert_eq!(coords[0][2], 1000.0);
        assert_eq!(coords[1][2], 0.0);
        assert_eq!(geojson["features"][0]["properties"]["points"], 2);
    }
}
