use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::web::AppState;

/// GET /status: process health for dashboards and deploy checks.
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let queue_depths = state.ingest_queue.as_ref().map(|queue| {
        let depths = queue.depths();
        json!({
            "ready": depths.ready,
            "delayed": depths.delayed,
            "deadLettered": depths.dead_lettered,
        })
    });

    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "liveStateCache": state.cache.as_ref().map(|cache| json!({
            "entries": cache.len(),
        })),
        "ingestQueue": queue_depths,
        "liveUpdates": state.broadcaster.is_some(),
    }))
}
