//! WebSocket fan-out: consume the pub/sub event stream, buffer briefly, and
//! emit one batched update per bounding-box room.
//!
//! Rooms are keyed by their bounds rounded to 0.01 degrees so two clients
//! looking at effectively the same viewport share a room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EVENTS_SUBJECT, Event};
use crate::geo::BoundingBox;

/// Buffered events flush at least this often.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// A room flushes early once its buffer holds this many aircraft.
const MAX_BATCH: usize = 100;

/// Broadcast channel depth per room; slow clients drop, not block.
const ROOM_CHANNEL_CAPACITY: usize = 64;

/// Round bounds to 0.01 degrees and derive the room identifier.
pub fn room_key(bbox: &BoundingBox) -> String {
    format!(
        "{:.2}:{:.2}:{:.2}:{:.2}",
        bbox.lat_min, bbox.lon_min, bbox.lat_max, bbox.lon_max
    )
}

/// The one message shape rooms receive.
#[derive(Debug, Clone, Serialize)]
pub struct RoomUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: UpdateData,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateData {
    pub updated: Vec<serde_json::Value>,
}

struct Room {
    bbox: BoundingBox,
    sender: broadcast::Sender<String>,
}

type Rooms = Arc<RwLock<HashMap<String, Room>>>;

pub struct WsBroadcaster {
    nats: async_nats::Client,
    rooms: Rooms,
}

impl WsBroadcaster {
    pub fn new(nats: async_nats::Client) -> Self {
        Self {
            nats,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Join a room for the given bounds, creating it on first subscribe.
    pub async fn subscribe(&self, bbox: BoundingBox) -> broadcast::Receiver<String> {
        let key = room_key(&bbox);
        let mut rooms = self.rooms.write().await;
        let receiver = rooms
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(room = %key, "Creating broadcast room");
                let (sender, _) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
                Room { bbox, sender }
            })
            .sender
            .subscribe();
        metrics::gauge!("ws.rooms").set(rooms.len() as f64);
        receiver
    }

    /// Drop a room once its last receiver is gone.
    pub async fn cleanup_room(&self, bbox: &BoundingBox) {
        let key = room_key(bbox);
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&key)
            && room.sender.receiver_count() == 0
        {
            rooms.remove(&key);
            debug!(room = %key, "Removed empty broadcast room");
            metrics::gauge!("ws.rooms").set(rooms.len() as f64);
        }
    }

    /// Subscribe to the pub/sub subject and run the batch/flush loop.
    pub async fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut subscriber = self.nats.subscribe(EVENTS_SUBJECT).await?;
        let rooms = self.rooms.clone();

        info!("WebSocket broadcaster subscribed to '{}'", EVENTS_SUBJECT);
        let handle = tokio::spawn(async move {
            // Per-room pending updates, deduplicated per icao24 latest-wins
            let mut pending: HashMap<String, HashMap<String, serde_json::Value>> = HashMap::new();
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("WebSocket broadcaster stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        flush(&rooms, &mut pending).await;
                    }
                    message = subscriber.next() => {
                        let Some(message) = message else {
                            warn!("Pub/sub stream closed, broadcaster exiting");
                            return;
                        };
                        let event: Event = match serde_json::from_slice(&message.payload) {
                            Ok(event) => event,
                            Err(e) => {
                                error!("Undecodable event on pub/sub: {}", e);
                                continue;
                            }
                        };
                        buffer_event(&rooms, &mut pending, event).await;

                        let full = pending.values().any(|room| room.len() >= MAX_BATCH);
                        if full {
                            flush(&rooms, &mut pending).await;
                        }
                    }
                }
            }
        });
        Ok(handle)
    }
}

/// Route one event into the buffers of every room containing its position.
/// Events without a valid position are dropped.
async fn buffer_event(
    rooms: &Rooms,
    pending: &mut HashMap<String, HashMap<String, serde_json::Value>>,
    event: Event,
) {
    let payload = event.payload;
    let (Some(lat), Some(lon)) = (
        payload.get("latitude").and_then(|v| v.as_f64()),
        payload.get("longitude").and_then(|v| v.as_f64()),
    ) else {
        metrics::counter!("ws.events_without_position").increment(1);
        return;
    };
    let Some(icao24) = payload.get("icao24").and_then(|v| v.as_str()).map(String::from) else {
        return;
    };

    let rooms = rooms.read().await;
    for (key, room) in rooms.iter() {
        if room.bbox.contains(lat, lon) {
            pending
                .entry(key.clone())
                .or_default()
                .insert(icao24.clone(), payload.clone());
        }
    }
}

/// Emit one `aircraft:update` message per room with pending updates.
async fn flush(rooms: &Rooms, pending: &mut HashMap<String, HashMap<String, serde_json::Value>>) {
    if pending.is_empty() {
        return;
    }

    let rooms = rooms.read().await;
    for (key, updates) in pending.drain() {
        if updates.is_empty() {
            continue;
        }
        let Some(room) = rooms.get(&key) else {
            continue;
        };

        let update = RoomUpdate {
            kind: "incremental",
            data: UpdateData {
                updated: updates.into_values().collect(),
            },
        };
        match serde_json::to_string(&update) {
            Ok(json) => {
                metrics::counter!("ws.batches_sent").increment(1);
                // Send errors just mean the room has no receivers right now
                let _ = room.sender.send(json);
            }
            Err(e) => error!("Failed to serialize room update: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(icao24: &str, lat: Option<f64>, lon: Option<f64>, velocity: f64) -> Event {
        Event {
            id: Uuid::new_v4(),
            event_type: "aircraft.position.updated".to_string(),
            version: "v1".to_string(),
            occurred_at: Utc::now(),
            payload: serde_json::json!({
                "icao24": icao24,
                "latitude": lat,
                "longitude": lon,
                "velocity": velocity,
            }),
        }
    }

    fn rooms_with(bbox: BoundingBox) -> (Rooms, broadcast::Receiver<String>, String) {
        let (sender, receiver) = broadcast::channel(8);
        let key = room_key(&bbox);
        let mut map = HashMap::new();
        map.insert(key.clone(), Room { bbox, sender });
        (Arc::new(RwLock::new(map)), receiver, key)
    }

    #[tokio::test]
    async fn events_buffer_into_matching_rooms_only() {
        let bbox = BoundingBox::new(39.0, -75.0, 41.0, -73.0).unwrap();
        let (rooms, _rx, key) = rooms_with(bbox);
        let mut pending = HashMap::new();

        buffer_event(&rooms, &mut pending, event("inside", Some(40.0), Some(-74.0), 100.0)).await;
        buffer_event(&rooms, &mut pending, event("outsid", Some(50.0), Some(-74.0), 100.0)).await;

        assert_eq!(pending[&key].len(), 1);
        assert!(pending[&key].contains_key("inside"));
    }

    #[tokio::test]
    async fn positionless_events_are_dropped() {
        let bbox = BoundingBox::new(39.0, -75.0, 41.0, -73.0).unwrap();
        let (rooms, _rx, _key) = rooms_with(bbox);
        let mut pending = HashMap::new();

        buffer_event(&rooms, &mut pending, event("nopos1", None, None, 100.0)).await;
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn dedup_is_latest_wins_per_aircraft() {
        let bbox = BoundingBox::new(39.0, -75.0, 41.0, -73.0).unwrap();
        let (rooms, mut rx, key) = rooms_with(bbox);
        let mut pending = HashMap::new();

        buffer_event(&rooms, &mut pending, event("a1b2c3", Some(40.0), Some(-74.0), 100.0)).await;
        buffer_event(&rooms, &mut pending, event("a1b2c3", Some(40.1), Some(-74.1), 200.0)).await;
        assert_eq!(pending[&key].len(), 1);

        flush(&rooms, &mut pending).await;
        let message = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "incremental");
        let updated = value["data"]["updated"].as_array().unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["velocity"], 200.0);
        assert!(pending.is_empty());
    }

    #[test]
    fn room_keys_round_to_hundredths() {
        let a = BoundingBox::new(40.1234, -74.5678, 41.0011, -73.0099).unwrap();
        let b = BoundingBox::new(40.1199, -74.5703, 41.0049, -73.0101).unwrap();
        assert_eq!(room_key(&a), "40.12:-74.57:41.00:-73.01");
        assert_eq!(room_key(&a), room_key(&b));

        let c = BoundingBox::new(40.2, -74.5, 41.0, -73.0).unwrap();
        assert_ne!(room_key(&a), room_key(&c));
    }

    #[test]
    fn update_message_shape() {
        let update = RoomUpdate {
            kind: "incremental",
            data: UpdateData {
                updated: vec![serde_json::json!({"icao24": "a1b2c3"})],
            },
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "incremental");
        assert_eq!(value["data"]["updated"][0]["icao24"], "a1b2c3");
    }
}
