use std::collections::HashMap;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::geo::BoundingBox;
use crate::web::AppState;
use crate::ws_broadcaster::room_key;

/// Room control messages a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all_fields = "camelCase")]
pub enum RoomControl {
    #[serde(rename = "subscribe")]
    Subscribe {
        lat_min: f64,
        lon_min: f64,
        lat_max: f64,
        lon_max: f64,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        lat_min: f64,
        lon_min: f64,
        lat_max: f64,
        lon_max: f64,
    },
}

/// GET /live: WebSocket endpoint for bounds-room subscriptions.
pub async fn live_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let Some(broadcaster) = state.broadcaster.clone() else {
        warn!("Live updates unavailable, closing WebSocket");
        return;
    };

    info!("WebSocket client connected");
    metrics::gauge!("ws.connections").increment(1.0);

    let (mut sender, mut receiver) = socket.split();

    // One writer task owns the sink; room forwarders feed it
    let (out_tx, out_rx) = flume::unbounded::<String>();
    let write_task: JoinHandle<()> = tokio::spawn(async move {
        while let Ok(text) = out_rx.recv_async().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    });

    // Active room forwarders for this connection, keyed by room
    let mut forwarders: HashMap<String, (BoundingBox, JoinHandle<()>)> = HashMap::new();

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let control: RoomControl = match serde_json::from_str(&text) {
                    Ok(control) => control,
                    Err(e) => {
                        debug!("Ignoring unparseable room control [{text}]: {e}");
                        continue;
                    }
                };
                match control {
                    RoomControl::Subscribe {
                        lat_min,
                        lon_min,
                        lat_max,
                        lon_max,
                    } => {
                        let Ok(bbox) = BoundingBox::new(lat_min, lon_min, lat_max, lon_max) else {
                            debug!("Rejecting subscription with invalid bounds");
                            continue;
                        };
                        let key = room_key(&bbox);
                        if forwarders.contains_key(&key) {
                            continue;
                        }

                        let mut room_rx = broadcaster.subscribe(bbox).await;
                        let tx = out_tx.clone();
                        let forward = tokio::spawn(async move {
                            while let Ok(update) = room_rx.recv().await {
                                if tx.send(update).is_err() {
                                    return;
                                }
                            }
                        });
                        debug!(room = %key, "Client joined room");
                        forwarders.insert(key, (bbox, forward));
                    }
                    RoomControl::Unsubscribe {
                        lat_min,
                        lon_min,
                        lat_max,
                        lon_max,
                    } => {
                        let Ok(bbox) = BoundingBox::new(lat_min, lon_min, lat_max, lon_max) else {
                            continue;
                        };
                        let key = room_key(&bbox);
                        if let Some((bbox, handle)) = forwarders.remove(&key) {
                            handle.abort();
                            broadcaster.cleanup_room(&bbox).await;
                            debug!(room = %key, "Client left room");
                        }
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary, ping, pong
            Err(e) => {
                debug!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    for (_, (bbox, handle)) in forwarders.drain() {
        handle.abort();
        broadcaster.cleanup_room(&bbox).await;
    }
    write_task.abort();

    metrics::gauge!("ws.connections").decrement(1.0);
    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_parse() {
        let subscribe: RoomControl = serde_json::from_str(
            r#"{"action":"subscribe","latMin":39.0,"lonMin":-75.0,"latMax":41.0,"lonMax":-73.0}"#,
        )
        .unwrap();
        assert!(matches!(subscribe, RoomControl::Subscribe { lat_min, .. } if lat_min == 39.0));

        let unsubscribe: RoomControl = serde_json::from_str(
            r#"{"action":"unsubscribe","latMin":39.0,"lonMin":-75.0,"latMax":41.0,"lonMax":-73.0}"#,
        )
        .unwrap();
        assert!(matches!(unsubscribe, RoomControl::Unsubscribe { .. }));
    }
}
