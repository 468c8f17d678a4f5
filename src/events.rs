//! Canonical event envelope emitted for every accepted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aircraft_states::AircraftState;

pub const EVENT_AIRCRAFT_POSITION_UPDATED: &str = "aircraft.position.updated";
pub const EVENT_VERSION: &str = "v1";

/// The pub/sub subject all events go out on.
pub const EVENTS_SUBJECT: &str = "events";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn position_updated(state: &AircraftState) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: EVENT_AIRCRAFT_POSITION_UPDATED.to_string(),
            version: EVENT_VERSION.to_string(),
            occurred_at: Utc::now(),
            payload: serde_json::to_value(state).unwrap_or(serde_json::Value::Null),
        }
    }

    /// The exact bytes that are published, persisted, and signed.
    pub fn body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Position updates are never shed under backpressure.
    pub fn is_essential(event_type: &str) -> bool {
        event_type == EVENT_AIRCRAFT_POSITION_UPDATED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft_states::DataSource;

    fn sample_state() -> AircraftState {
        AircraftState {
            icao24: "a1b2c3".to_string(),
            callsign: Some("UAL123".to_string()),
            registration: None,
            latitude: Some(40.0),
            longitude: Some(-74.0),
            baro_altitude: Some(10_000.0),
            geo_altitude: None,
            velocity: Some(230.0),
            true_track: Some(270.0),
            vertical_rate: None,
            on_ground: false,
            squawk: None,
            emergency_status: None,
            category: Some(4),
            aircraft_type: None,
            aircraft_description: None,
            data_source: DataSource::Feeder,
            source_priority: 10,
            time_position: Some(1_700_000_000),
            last_contact: 1_700_000_000,
            ingestion_timestamp: Utc::now(),
        }
    }

    #[test]
    fn envelope_shape() {
        let event = Event::position_updated(&sample_state());
        let value: serde_json::Value = serde_json::from_slice(&event.body().unwrap()).unwrap();

        assert_eq!(value["type"], "aircraft.position.updated");
        assert_eq!(value["version"], "v1");
        assert!(value["id"].is_string());
        assert!(value["occurred_at"].is_string());
        assert_eq!(value["payload"]["icao24"], "a1b2c3");
        assert_eq!(value["payload"]["dataSource"], "feeder");
        assert_eq!(value["payload"]["sourcePriority"], 10);
    }

    #[test]
    fn round_trips_through_serde() {
        let event = Event::position_updated(&sample_state());
        let bytes = event.body().unwrap();
        let back: Event = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.event_type, event.event_type);
    }

    #[test]
    fn only_position_updates_are_essential() {
        assert!(Event::is_essential(EVENT_AIRCRAFT_POSITION_UPDATED));
        assert!(!Event::is_essential("aircraft.landed"));
    }
}
