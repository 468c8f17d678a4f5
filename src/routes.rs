//! Per-flight route annotations. Routes are enrichments only: they are
//! joined onto bounds-query results and drive the landed-aircraft snap, but
//! the priority store never depends on them.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A route annotation keyed by callsign when available, else icao24.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::routes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: Uuid,
    pub flight_key: String,
    pub callsign: Option<String>,
    pub icao24: Option<String>,
    pub departure_icao: Option<String>,
    pub departure_iata: Option<String>,
    pub departure_name: Option<String>,
    pub departure_latitude: Option<f64>,
    pub departure_longitude: Option<f64>,
    pub arrival_icao: Option<String>,
    pub arrival_iata: Option<String>,
    pub arrival_name: Option<String>,
    pub arrival_latitude: Option<f64>,
    pub arrival_longitude: Option<f64>,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub actual_departure: Option<DateTime<Utc>>,
    pub scheduled_arrival: Option<DateTime<Utc>>,
    pub actual_arrival: Option<DateTime<Utc>>,
    pub aircraft_type: Option<String>,
    pub progress_percent: Option<i32>,
    pub flight_status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    /// Pick the key a state would be joined under: callsign first, icao24
    /// as the fallback.
    pub fn key_for(callsign: Option<&str>, icao24: &str) -> String {
        match callsign {
            Some(cs) if !cs.is_empty() => cs.to_string(),
            _ => icao24.to_string(),
        }
    }

    pub fn has_endpoints(&self) -> bool {
        self.departure_latitude.is_some()
            && self.departure_longitude.is_some()
            && self.arrival_latitude.is_some()
            && self.arrival_longitude.is_some()
    }

    /// Whether this flight has finished per the route annotation: either an
    /// explicit landed/arrived status, or an actual arrival in the past.
    pub fn has_arrived(&self, now: DateTime<Utc>) -> bool {
        if let Some(status) = &self.flight_status {
            let status = status.to_ascii_lowercase();
            if status.contains("landed") || status.contains("arrived") {
                return true;
            }
        }
        matches!(self.actual_arrival, Some(at) if at <= now)
    }
}

/// Airport leg as presented to API clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirportInfo {
    pub icao: Option<String>,
    pub iata: Option<String>,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Route enrichment attached to bounds-query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub departure: Option<AirportInfo>,
    pub arrival: Option<AirportInfo>,
    pub aircraft: Option<String>,
    pub flight_status: Option<String>,
    pub progress_percent: Option<i32>,
}

impl From<&Route> for RouteInfo {
    fn from(route: &Route) -> Self {
        let departure = route.departure_icao.is_some().then(|| AirportInfo {
            icao: route.departure_icao.clone(),
            iata: route.departure_iata.clone(),
            name: route.departure_name.clone(),
            latitude: route.departure_latitude,
            longitude: route.departure_longitude,
        });
        let arrival = route.arrival_icao.is_some().then(|| AirportInfo {
            icao: route.arrival_icao.clone(),
            iata: route.arrival_iata.clone(),
            name: route.arrival_name.clone(),
            latitude: route.arrival_latitude,
            longitude: route.arrival_longitude,
        });
        Self {
            departure,
            arrival,
            aircraft: route.aircraft_type.clone(),
            flight_status: route.flight_status.clone(),
            progress_percent: route.progress_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_route(flight_key: &str) -> Route {
        Route {
            id: Uuid::new_v4(),
            flight_key: flight_key.to_string(),
            callsign: Some(flight_key.to_string()),
            icao24: None,
            departure_icao: Some("KJFK".to_string()),
            departure_iata: Some("JFK".to_string()),
            departure_name: Some("John F Kennedy Intl".to_string()),
            departure_latitude: Some(40.6413),
            departure_longitude: Some(-73.7781),
            arrival_icao: Some("KLAX".to_string()),
            arrival_iata: Some("LAX".to_string()),
            arrival_name: Some("Los Angeles Intl".to_string()),
            arrival_latitude: Some(33.9416),
            arrival_longitude: Some(-118.4085),
            scheduled_departure: None,
            actual_departure: None,
            scheduled_arrival: None,
            actual_arrival: None,
            aircraft_type: Some("B738".to_string()),
            progress_percent: Some(50),
            flight_status: Some("En Route".to_string()),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn key_prefers_callsign() {
        assert_eq!(Route::key_for(Some("UAL123"), "a1b2c3"), "UAL123");
        assert_eq!(Route::key_for(None, "a1b2c3"), "a1b2c3");
        assert_eq!(Route::key_for(Some(""), "a1b2c3"), "a1b2c3");
    }

    #[test]
    fn arrived_by_status_or_timestamp() {
        let now = Utc::now();
        let mut route = sample_route("UAL123");
        assert!(!route.has_arrived(now));

        route.flight_status = Some("Landed".to_string());
        assert!(route.has_arrived(now));

        route.flight_status = Some("En Route".to_string());
        route.actual_arrival = Some(now - chrono::Duration::minutes(15));
        assert!(route.has_arrived(now));

        route.actual_arrival = Some(now + chrono::Duration::minutes(15));
        assert!(!route.has_arrived(now));
    }

    #[test]
    fn route_info_omits_missing_legs() {
        let mut route = sample_route("UAL123");
        route.arrival_icao = None;
        let info = RouteInfo::from(&route);
        assert!(info.departure.is_some());
        assert!(info.arrival.is_none());
    }
}
