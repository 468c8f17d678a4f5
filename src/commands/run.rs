//! The full data plane: queues, ingestion workers, provider pollers, the
//! CONUS scanner, webhook delivery, WebSocket fan-out, and the HTTP API,
//! all in one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aircraft_states_repo::AircraftStatesRepository;
use crate::circuit_breaker::CircuitBreakers;
use crate::config::AppConfig;
use crate::conus_scan::ConusScanScheduler;
use crate::event_publisher::EventPublisher;
use crate::geo::BoundingBox;
use crate::ingest_queue::{DeliveryMessage, DurableQueue, StateMessage};
use crate::ingestion_worker::IngestionWorker;
use crate::providers::ProviderAdapter;
use crate::providers::aero_api::AeroApiAdapter;
use crate::providers::commercial_network::CommercialNetworkAdapter;
use crate::providers::free_network::FreeNetworkAdapter;
use crate::rate_limit_governor::RateLimitGovernor;
use crate::rate_limit_window::RateLimitWindows;
use crate::routes_repo::RoutesRepository;
use crate::webhook_deliverer::WebhookDeliverer;
use crate::webhooks_repo::WebhooksRepository;
use crate::ws_broadcaster::WsBroadcaster;

/// Global polls of the free network.
const FREE_NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Route-enrichment sweeps of the paid API are deliberately slow.
const AERO_API_POLL_INTERVAL: Duration = Duration::from_secs(300);

pub async fn handle_run(config: AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)> = Vec::new();

    tokio::spawn(crate::metrics::start_metrics_server(config.http.metrics_port));

    let pool = super::create_pool()?;
    let store = AircraftStatesRepository::new(pool.clone());
    let routes_repo = RoutesRepository::new(pool.clone());
    let webhooks_repo = WebhooksRepository::new(pool.clone());

    let cache = super::build_cache(&config, &store).await;

    // Queues: the only cross-task coordination primitive in the process
    let ingest_queue = Arc::new(DurableQueue::<StateMessage>::open(
        "ingest",
        &config.queue.data_dir,
        &config.queue.ready_key,
        &config.queue.delayed_key,
        &config.queue.dlq_key,
        config.queue.high_water_mark,
    )?);
    tasks.push(("ingest-mover", ingest_queue.clone().spawn_mover()));

    let webhook_queue = if config.webhooks.enabled {
        let queue = Arc::new(DurableQueue::<DeliveryMessage>::open(
            "webhook",
            &config.queue.data_dir,
            &config.webhooks.ready_key,
            &config.webhooks.delayed_key,
            &config.webhooks.dlq_key,
            config.webhooks.high_water_mark,
        )?);
        tasks.push(("webhook-mover", queue.clone().spawn_mover()));
        Some(queue)
    } else {
        None
    };

    let nats = super::connect_nats().await;

    let publisher = Arc::new(EventPublisher::new(
        nats.clone(),
        webhooks_repo.clone(),
        webhook_queue.clone(),
    ));

    // Ingestion workers
    for worker_id in 0..config.ingestion.worker_count {
        let worker = IngestionWorker::new(
            ingest_queue.clone(),
            store.clone(),
            cache.clone(),
            publisher.clone(),
            config.ingestion.batch_size,
            config.ingestion.max_retries,
        );
        let worker_cancel = cancel.clone();
        tasks.push((
            "ingestion-worker",
            tokio::spawn(async move { worker.run(worker_id, worker_cancel).await }),
        ));
    }

    // Providers share one governor so the retry policy lives in one place
    let governor = Arc::new(RateLimitGovernor::new());
    governor.set_daily_budget("free-network", config.providers.free_network.daily_budget);
    governor.set_daily_budget(
        "commercial-network",
        config.providers.commercial_network.daily_budget,
    );
    governor.set_daily_budget("aero-api", config.providers.aero_api.daily_budget);

    if config.providers.free_network.enabled {
        let adapter = Arc::new(FreeNetworkAdapter::new(
            &config.providers.free_network,
            governor.clone(),
        ));
        tasks.push((
            "free-network-poller",
            spawn_provider_poller(
                adapter,
                ingest_queue.clone(),
                routes_repo.clone(),
                FREE_NETWORK_POLL_INTERVAL,
                None,
                cancel.clone(),
            ),
        ));
    }

    if config.providers.aero_api.enabled {
        let adapter = Arc::new(AeroApiAdapter::new(
            &config.providers.aero_api,
            governor.clone(),
        ));
        // The paid API sweeps CONUS for states and route annotations
        let conus = BoundingBox::new(24.5, -125.0, 49.5, -66.9).expect("static bounds");
        tasks.push((
            "aero-api-poller",
            spawn_provider_poller(
                adapter,
                ingest_queue.clone(),
                routes_repo.clone(),
                AERO_API_POLL_INTERVAL,
                Some(conus),
                cancel.clone(),
            ),
        ));
    }

    if config.scanner.enabled {
        if config.providers.commercial_network.enabled {
            let adapter = Arc::new(CommercialNetworkAdapter::new(
                &config.providers.commercial_network,
                governor.clone(),
            ));
            let scheduler =
                ConusScanScheduler::new(adapter, ingest_queue.clone(), config.scanner.interval_ms);
            let scan_cancel = cancel.clone();
            tasks.push((
                "conus-scan",
                tokio::spawn(async move { scheduler.run(scan_cancel).await }),
            ));
        } else {
            warn!("Scanner enabled but the commercial network is not; skipping");
        }
    }

    // Webhook delivery
    if let Some(queue) = &webhook_queue {
        let deliverer = WebhookDeliverer::new(
            webhooks_repo.clone(),
            queue.clone(),
            Arc::new(CircuitBreakers::new(&config.webhooks.circuit_breaker)),
            Arc::new(RateLimitWindows::per_minute()),
            config.webhooks.clone(),
        );
        let deliverer_cancel = cancel.clone();
        tasks.push((
            "webhook-deliverer",
            tokio::spawn(async move { deliverer.run(deliverer_cancel).await }),
        ));
    }

    // WebSocket fan-out
    let broadcaster = match &nats {
        Some(nats) => {
            let broadcaster = Arc::new(WsBroadcaster::new(nats.clone()));
            match broadcaster.start(cancel.clone()).await {
                Ok(handle) => {
                    tasks.push(("ws-broadcaster", handle));
                    Some(broadcaster)
                }
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

    // HTTP front
    let app_state = super::build_app_state(
        &config,
        pool,
        cache.clone(),
        Some(ingest_queue.clone()),
        broadcaster,
    );
    let web_cancel = cancel.clone();
    let interface = config.http.interface.clone();
    let port = config.http.port;
    tasks.push((
        "web-server",
        tokio::spawn(async move {
            if let Err(e) = crate::web::start_web_server(&interface, port, app_state, web_cancel).await
            {
                error!("Web server exited with error: {}", e);
            }
        }),
    ));

    info!("Data plane up with {} tasks", tasks.len());
    super::shutdown_signal().await;

    info!("Shutting down, draining workers");
    cancel.cancel();
    for (name, task) in tasks {
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                error!("Task '{}' ended abnormally: {}", name, e);
            }
        }
    }

    if let Some(cache) = &cache {
        cache.stop();
    }
    // Spill unconsumed messages so the next run picks them up
    ingest_queue.flush()?;
    if let Some(queue) = &webhook_queue {
        queue.flush()?;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Drive one provider on a timer: fetch, persist route annotations, enqueue
/// states. Skips the fetch entirely while the queue is backpressured.
fn spawn_provider_poller(
    adapter: Arc<dyn ProviderAdapter>,
    queue: Arc<DurableQueue<StateMessage>>,
    routes_repo: RoutesRepository,
    interval: Duration,
    bounds: Option<BoundingBox>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            provider = adapter.name(),
            interval_secs = interval.as_secs(),
            "Provider poller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(provider = adapter.name(), "Provider poller stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if queue.is_backpressured() {
                warn!(
                    provider = adapter.name(),
                    "Ingest queue backpressured, skipping poll"
                );
                continue;
            }

            let batch = match bounds {
                Some(bbox) => adapter.fetch_bounds(&bbox).await,
                None => adapter.fetch_all().await,
            };

            for route in batch.routes {
                if let Err(e) = routes_repo.upsert(route).await {
                    error!(provider = adapter.name(), "Route upsert failed: {}", e);
                }
            }

            if !batch.states.is_empty() {
                let now = chrono::Utc::now();
                let messages: Vec<StateMessage> = batch
                    .states
                    .into_iter()
                    .map(|state| StateMessage {
                        source: state.data_source,
                        source_priority: state.source_priority,
                        ingestion_timestamp: now,
                        retries: 0,
                        available_at: now.timestamp_millis(),
                        skip_history: false,
                        state,
                    })
                    .collect();
                queue.enqueue_batch(messages);
            }
        }
    })
}
