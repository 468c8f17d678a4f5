//! Round-robin scan of the continental U.S. through the commercial
//! network's point query, one anchor per second (the provider's quota).
//!
//! Scan results are enqueued with `skip_history` set so the 1 Hz rotation
//! does not fill the history with redundant snapshots. Per-point failures
//! never stall the rotation; the governor still owns the global budget.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingest_queue::{DurableQueue, StateMessage};
use crate::providers::commercial_network::CommercialNetworkAdapter;

#[derive(Debug, Clone, Copy)]
pub struct ScanPoint {
    pub lat: f64,
    pub lon: f64,
    pub radius_nm: f64,
}

/// Anchor radius chosen so neighboring circles overlap.
const ANCHOR_RADIUS_NM: f64 = 230.0;

/// Ordered anchor grid covering roughly 25N..49N, 125W..67W.
pub fn conus_anchor_points() -> Vec<ScanPoint> {
    let mut points = Vec::new();
    let mut lat = 26.0;
    while lat <= 48.5 {
        let mut lon = -124.0;
        while lon <= -68.0 {
            points.push(ScanPoint {
                lat,
                lon,
                radius_nm: ANCHOR_RADIUS_NM,
            });
            lon += 7.0;
        }
        lat += 5.5;
    }
    points
}

pub struct ConusScanScheduler {
    adapter: Arc<CommercialNetworkAdapter>,
    queue: Arc<DurableQueue<StateMessage>>,
    points: Vec<ScanPoint>,
    interval: std::time::Duration,
}

impl ConusScanScheduler {
    pub fn new(
        adapter: Arc<CommercialNetworkAdapter>,
        queue: Arc<DurableQueue<StateMessage>>,
        interval_ms: u64,
    ) -> Self {
        Self {
            adapter,
            queue,
            points: conus_anchor_points(),
            interval: std::time::Duration::from_millis(interval_ms.max(100)),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            anchors = self.points.len(),
            interval_ms = self.interval.as_millis(),
            "CONUS scan scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut index = 0usize;
        let mut cycle_states = 0usize;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("CONUS scan scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            // Shed rotations while the ingest queue is over its high-water
            // mark; the backlog has to drain before we add to it.
            if self.queue.is_backpressured() {
                warn!("Ingest queue backpressured, skipping CONUS rotation");
                metrics::counter!("conus_scan.skipped_backpressure").increment(1);
                continue;
            }

            let point = self.points[index];
            let batch = self
                .adapter
                .fetch_point(point.lat, point.lon, point.radius_nm)
                .await;

            if batch.states.is_empty() {
                debug!(
                    lat = point.lat,
                    lon = point.lon,
                    "Scan point returned no aircraft"
                );
            } else {
                cycle_states += batch.states.len();
                let now = Utc::now();
                let messages: Vec<StateMessage> = batch
                    .states
                    .into_iter()
                    .map(|state| StateMessage {
                        source: state.data_source,
                        source_priority: state.source_priority,
                        ingestion_timestamp: now,
                        retries: 0,
                        available_at: now.timestamp_millis(),
                        skip_history: true,
                        state,
                    })
                    .collect();
                self.queue.enqueue_batch(messages);
            }
            metrics::counter!("conus_scan.points_polled").increment(1);

            index += 1;
            if index >= self.points.len() {
                info!(
                    states = cycle_states,
                    anchors = self.points.len(),
                    "CONUS scan cycle complete"
                );
                metrics::counter!("conus_scan.cycles_completed").increment(1);
                index = 0;
                cycle_states = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_grid_covers_conus() {
        let points = conus_anchor_points();
        assert!(points.len() > 30, "grid too sparse: {}", points.len());

        for point in &points {
            assert!((25.0..=49.0).contains(&point.lat));
            assert!((-125.0..=-67.0).contains(&point.lon));
            assert_eq!(point.radius_nm, ANCHOR_RADIUS_NM);
        }

        // Ordered: rows south to north, west to east within a row
        let first = points.first().unwrap();
        let last = points.last().unwrap();
        assert!(first.lat < last.lat);
    }
}
