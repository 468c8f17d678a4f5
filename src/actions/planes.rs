use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::error;

use super::json_error;
use crate::web::AppState;

/// GET /planes/{identifier}: one enriched aircraft by icao24 or callsign.
pub async fn get_plane(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> axum::response::Response {
    if identifier.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "identifier required").into_response();
    }

    match state.planner.get_aircraft(&identifier).await {
        Ok(Some(aircraft)) => Json(aircraft).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "aircraft not found").into_response(),
        Err(e) => {
            error!("Aircraft lookup failed for {}: {}", identifier, e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response()
        }
    }
}
