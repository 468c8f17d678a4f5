//! HTTP/WebSocket front only: bounds queries, aircraft lookups, history,
//! feeder intake, and live rooms. Ingestion workers run elsewhere.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aircraft_states_repo::AircraftStatesRepository;
use crate::config::AppConfig;
use crate::ingest_queue::{DurableQueue, StateMessage};
use crate::ws_broadcaster::WsBroadcaster;

pub async fn handle_web(config: AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();

    tokio::spawn(crate::metrics::start_metrics_server(config.http.metrics_port));

    let pool = super::create_pool()?;
    let store = AircraftStatesRepository::new(pool.clone());
    let cache = super::build_cache(&config, &store).await;

    // The feeder endpoint needs somewhere to put pushes; a front-only
    // process still opens the shared queue directory.
    let ingest_queue = if config.queue.enabled {
        let queue = Arc::new(DurableQueue::<StateMessage>::open(
            "ingest",
            &config.queue.data_dir,
            &config.queue.ready_key,
            &config.queue.delayed_key,
            &config.queue.dlq_key,
            config.queue.high_water_mark,
        )?);
        queue.clone().spawn_mover();
        Some(queue)
    } else {
        None
    };

    let broadcaster = match super::connect_nats().await {
        Some(nats) => {
            let broadcaster = Arc::new(WsBroadcaster::new(nats));
            match broadcaster.start(cancel.clone()).await {
                Ok(_) => Some(broadcaster),
                Err(e) => {
                    error!("Failed to start WebSocket broadcaster: {}", e);
                    None
                }
            }
        }
        None => {
            warn!("NATS not configured; live WebSocket updates disabled");
            None
        }
    };

    let app_state =
        super::build_app_state(&config, pool, cache.clone(), ingest_queue.clone(), broadcaster);

    let web_cancel = cancel.clone();
    let interface = config.http.interface.clone();
    let port = config.http.port;
    let server = tokio::spawn(async move {
        if let Err(e) = crate::web::start_web_server(&interface, port, app_state, web_cancel).await {
            error!("Web server exited with error: {}", e);
        }
    });

    super::shutdown_signal().await;
    info!("Shutting down web front");
    cancel.cancel();
    let _ = server.await;

    if let Some(cache) = &cache {
        cache.stop();
    }
    if let Some(queue) = &ingest_queue {
        queue.flush()?;
    }

    Ok(())
}
