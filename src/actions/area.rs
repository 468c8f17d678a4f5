use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::error;

use super::json_error;
use crate::geo::BoundingBox;
use crate::web::AppState;

/// GET /area/{latmin}/{lonmin}/{latmax}/{lonmax}
///
/// Bounds queries never fail because of provider problems; at worst the
/// entries come back flagged stale.
pub async fn get_area(
    State(state): State<AppState>,
    Path((lat_min, lon_min, lat_max, lon_max)): Path<(f64, f64, f64, f64)>,
) -> axum::response::Response {
    let bbox = match BoundingBox::new(lat_min, lon_min, lat_max, lon_max) {
        Ok(bbox) => bbox,
        Err(reason) => return json_error(StatusCode::BAD_REQUEST, &reason).into_response(),
    };

    match state.planner.get_aircraft_in_bounds(bbox).await {
        Ok(aircraft) => Json(aircraft).into_response(),
        Err(e) => {
            error!("Bounds query failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "bounds query failed").into_response()
        }
    }
}
