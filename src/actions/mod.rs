pub mod area;
pub mod feeder;
pub mod history;
pub mod live;
pub mod planes;
pub mod status;
pub mod webhook_subscriptions;

pub use area::*;
pub use feeder::*;
pub use history::*;
pub use live::*;
pub use planes::*;
pub use status::*;
pub use webhook_subscriptions::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

/// Standard JSON error envelope.
pub fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": message })))
}
