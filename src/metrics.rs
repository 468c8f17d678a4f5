use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::info;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus exporter. Returns the render handle.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        // HTTP latency buckets: 1ms .. 10s
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("http_request_duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .expect("failed to set buckets for http_request_duration_seconds")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Background task updating process-level gauges every 5 seconds.
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb_str) = line.split_whitespace().nth(1)
                            && let Ok(kb) = kb_str.parse::<f64>()
                        {
                            metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
                        }
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Pre-register the data-plane metrics at zero so every series exists in
/// Prometheus before the first event.
pub fn initialize_pipeline_metrics() {
    // Ingestion
    metrics::counter!("ingestion.accepted").absolute(0);
    metrics::counter!("ingestion.superseded").absolute(0);
    metrics::counter!("ingestion.store_retries").absolute(0);
    metrics::counter!("ingestion.rejected.missing_icao24").absolute(0);
    metrics::counter!("ingestion.rejected.malformed_icao24").absolute(0);
    metrics::counter!("ingestion.rejected.coordinate_out_of_range").absolute(0);
    metrics::counter!("ingestion.rejected.contact_before_position").absolute(0);

    // Priority store
    metrics::counter!("aircraft_states.inserted").absolute(0);
    metrics::counter!("aircraft_states.replaced").absolute(0);
    metrics::counter!("aircraft_states.rejected").absolute(0);
    metrics::counter!("aircraft_states.history_appended").absolute(0);
    metrics::counter!("aircraft_states.history_errors").absolute(0);

    // Live-state cache
    metrics::gauge!("live_state_cache.entries").set(0.0);
    metrics::counter!("live_state_cache.hits").absolute(0);
    metrics::counter!("live_state_cache.misses").absolute(0);
    metrics::counter!("live_state_cache.evictions").absolute(0);
    metrics::counter!("live_state_cache.expired").absolute(0);

    // Bounds queries
    metrics::counter!("bounds_query.cache_only").absolute(0);
    metrics::counter!("bounds_query.store_fallback").absolute(0);

    // Events and webhooks
    metrics::counter!("events.published").absolute(0);
    metrics::counter!("events.pubsub_errors").absolute(0);
    metrics::counter!("events.webhook_shed").absolute(0);
    metrics::counter!("webhooks.delivered").absolute(0);
    metrics::counter!("webhooks.delivery_failures").absolute(0);
    metrics::counter!("webhooks.dead_lettered").absolute(0);
    metrics::counter!("webhooks.rate_limited").absolute(0);
    metrics::counter!("webhooks.breaker_trips").absolute(0);
    metrics::counter!("webhooks.breaker_deferred").absolute(0);

    // Scanner
    metrics::counter!("conus_scan.points_polled").absolute(0);
    metrics::counter!("conus_scan.cycles_completed").absolute(0);
    metrics::counter!("conus_scan.skipped_backpressure").absolute(0);

    // WebSocket fan-out
    metrics::gauge!("ws.connections").set(0.0);
    metrics::gauge!("ws.rooms").set(0.0);
    metrics::counter!("ws.batches_sent").absolute(0);
    metrics::counter!("ws.events_without_position").absolute(0);
}

/// Standalone metrics server exposing `/metrics` for scraping.
pub async fn start_metrics_server(port: u16) {
    let handle = init_metrics();
    METRICS_HANDLE
        .set(handle)
        .expect("Metrics handle already initialized");

    initialize_pipeline_metrics();
    tokio::spawn(process_metrics_task());

    let app = Router::new().route(
        "/metrics",
        get(|| async {
            let handle = METRICS_HANDLE.get().expect("Metrics handle not initialized");
            handle.render()
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind metrics server");

    axum::serve(listener, app).await.expect("Metrics server failed");
}
