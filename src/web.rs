use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::actions;
use crate::aircraft_states_repo::AircraftStatesRepository;
use crate::bounds_query::BoundsQueryPlanner;
use crate::config::WebhooksConfig;
use crate::ingest_queue::{DurableQueue, StateMessage};
use crate::live_state_cache::LiveStateCache;
use crate::webhooks_repo::WebhooksRepository;
use crate::ws_broadcaster::WsBroadcaster;

/// Shared state injected into every handler. Everything is an explicit
/// dependency so tests can substitute fakes.
#[derive(Clone)]
pub struct AppState {
    pub planner: Arc<BoundsQueryPlanner>,
    pub store: AircraftStatesRepository,
    pub cache: Option<LiveStateCache>,
    pub ingest_queue: Option<Arc<DurableQueue<StateMessage>>>,
    pub broadcaster: Option<Arc<WsBroadcaster>>,
    pub webhooks_repo: WebhooksRepository,
    pub webhook_defaults: Arc<WebhooksConfig>,
    pub enforce_https: bool,
    pub feeder_tokens: Arc<Vec<String>>,
    pub started_at: Instant,
}

/// Request logging with a short correlation id.
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start_time = Instant::now();

    info!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;
    let duration = start_time.elapsed();

    info!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        response.status().as_u16(),
        duration.as_secs_f64() * 1000.0
    );
    metrics::histogram!("http_request_duration_seconds").record(duration.as_secs_f64());

    response
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/area/{latmin}/{lonmin}/{latmax}/{lonmax}",
            get(actions::get_area),
        )
        .route("/planes/{identifier}", get(actions::get_plane))
        .route("/feeder/aircraft", post(actions::push_feeder_aircraft))
        .route("/history/{icao24}", get(actions::get_history))
        .route("/live", get(actions::live_websocket))
        .route("/status", get(actions::get_status))
        .route(
            "/webhooks/subscriptions",
            get(actions::list_subscriptions).post(actions::create_subscription),
        )
        .route(
            "/webhooks/subscriptions/{id}",
            axum::routing::delete(actions::delete_subscription),
        )
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(CorsLayer::permissive())
}

pub async fn start_web_server(
    interface: &str,
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{interface}:{port}")).await?;
    info!("Web server listening on http://{}:{}", interface, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
