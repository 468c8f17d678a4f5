pub mod run;
pub mod web;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::aircraft_states_repo::AircraftStatesRepository;
use crate::bounds_query::BoundsQueryPlanner;
use crate::config::AppConfig;
use crate::db::{self, PgPool};
use crate::live_state_cache::LiveStateCache;
use crate::routes_repo::RoutesRepository;
use crate::web::AppState;

/// Pool sized for the repos plus a little headroom for migrations.
const POOL_SIZE: u32 = 16;

pub fn database_url() -> Result<String> {
    std::env::var("DATABASE_URL").context("DATABASE_URL must be set")
}

pub fn nats_url() -> Option<String> {
    std::env::var("NATS_URL").ok()
}

pub fn create_pool() -> Result<PgPool> {
    let pool = db::create_pool(&database_url()?, POOL_SIZE)?;
    db::run_migrations(&pool)?;
    Ok(pool)
}

pub async fn connect_nats() -> Option<async_nats::Client> {
    let url = nats_url()?;
    match async_nats::connect(&url).await {
        Ok(client) => {
            info!("Connected to NATS at {}", url);
            Some(client)
        }
        Err(e) => {
            warn!("NATS unavailable ({}), running without pub/sub", e);
            None
        }
    }
}

/// Build and warm this process's live-state cache from a recent store
/// window. Every process owns its cache; there is no cross-process cache.
pub async fn build_cache(
    config: &AppConfig,
    store: &AircraftStatesRepository,
) -> Option<LiveStateCache> {
    if !config.live_state.enabled {
        info!("Live-state cache disabled by configuration");
        return None;
    }

    let cache = LiveStateCache::new(&config.live_state);
    match store
        .recent_states(
            config.live_state.ttl_seconds as i64,
            config.live_state.max_entries as i64,
        )
        .await
    {
        Ok(states) => {
            let count = states.len();
            for state in states {
                cache.upsert(state);
            }
            info!("Warmed live-state cache with {} recent states", count);
        }
        Err(e) => warn!("Cache warm-up failed, starting cold: {}", e),
    }
    cache.start();
    Some(cache)
}

pub fn build_app_state(
    config: &AppConfig,
    pool: PgPool,
    cache: Option<LiveStateCache>,
    ingest_queue: Option<Arc<crate::ingest_queue::DurableQueue<crate::ingest_queue::StateMessage>>>,
    broadcaster: Option<Arc<crate::ws_broadcaster::WsBroadcaster>>,
) -> AppState {
    let store = AircraftStatesRepository::new(pool.clone());
    let routes = RoutesRepository::new(pool.clone());
    let webhooks_repo = crate::webhooks_repo::WebhooksRepository::new(pool);
    let planner = Arc::new(BoundsQueryPlanner::new(
        cache.clone(),
        store.clone(),
        routes,
        config.live_state.min_results_before_db_fallback,
        config.capped_recent_contact_threshold(),
    ));

    AppState {
        planner,
        store,
        cache,
        ingest_queue,
        broadcaster,
        webhooks_repo,
        webhook_defaults: Arc::new(config.webhooks.clone()),
        enforce_https: config.webhooks.enforce_https,
        feeder_tokens: Arc::new(config.feeder.tokens.clone()),
        started_at: Instant::now(),
    }
}

/// Resolve when the process should shut down: SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
