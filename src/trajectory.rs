//! Trajectory prediction for aircraft whose last contact has gone stale.
//!
//! Two modes: great-circle interpolation between route endpoints when both
//! are known, dead reckoning along the last track otherwise. Predictions
//! are computed per response and never written back to the cache or store.

use chrono::{DateTime, Utc};

use crate::aircraft_states::AircraftState;
use crate::geo::{dead_reckon, great_circle_interpolate, haversine_meters};
use crate::providers::units::CATEGORY_ROTORCRAFT;
use crate::routes::Route;

/// Prediction starts once the position is this old.
pub const MIN_PREDICTION_AGE_SECONDS: i64 = 30;

/// Beyond this the extrapolation is noise; the entry stays where it was.
pub const MAX_PREDICTION_AGE_SECONDS: i64 = 600;

/// Slower aircraft maneuver too much to extrapolate.
pub const MIN_PREDICTION_VELOCITY_MPS: f64 = 50.0;

/// Altitude extrapolation ceiling, meters.
const MAX_ALTITUDE_METERS: f64 = 50_000.0;

/// Climb/descent rate assumed by the flight-phase heuristic.
const PHASE_RATE_MPS: f64 = 2.5;

/// Weight of time-based progress in the great-circle blend.
const TIME_PROGRESS_WEIGHT: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub latitude: f64,
    pub longitude: f64,
    pub baro_altitude: Option<f64>,
    pub confidence: f64,
}

/// Whether a state qualifies for prediction at all.
pub fn eligible(state: &AircraftState, now: DateTime<Utc>) -> bool {
    let age = state.contact_age_seconds(now);
    if !(MIN_PREDICTION_AGE_SECONDS..=MAX_PREDICTION_AGE_SECONDS).contains(&age) {
        return false;
    }
    if state.on_ground {
        return false;
    }
    if state.category == Some(CATEGORY_ROTORCRAFT) {
        return false;
    }
    if !state.has_position() {
        return false;
    }
    matches!(state.velocity, Some(v) if v >= MIN_PREDICTION_VELOCITY_MPS)
}

/// Predict the current position of a stale state. Returns `None` when the
/// state is not eligible or lacks the data either mode needs.
pub fn predict(state: &AircraftState, route: Option<&Route>, now: DateTime<Utc>) -> Option<Prediction> {
    if !eligible(state, now) {
        return None;
    }

    let elapsed = state.contact_age_seconds(now) as f64;
    let lat = state.latitude?;
    let lon = state.longitude?;
    let velocity = state.velocity?;

    let routed = route.filter(|r| r.has_endpoints());
    let (new_lat, new_lon) = match routed {
        Some(route) => great_circle_position(state, route, now, elapsed, lat, lon, velocity)?,
        None => {
            let track = state.true_track?;
            dead_reckon(lat, lon, track, velocity * elapsed)
        }
    };

    Some(Prediction {
        latitude: new_lat,
        longitude: new_lon,
        baro_altitude: predict_altitude(state, routed, now, elapsed),
        confidence: confidence(elapsed, routed.is_some()),
    })
}

fn great_circle_position(
    state: &AircraftState,
    route: &Route,
    now: DateTime<Utc>,
    elapsed: f64,
    lat: f64,
    lon: f64,
    velocity: f64,
) -> Option<(f64, f64)> {
    let dep_lat = route.departure_latitude?;
    let dep_lon = route.departure_longitude?;
    let arr_lat = route.arrival_latitude?;
    let arr_lon = route.arrival_longitude?;

    let total_distance = haversine_meters(dep_lat, dep_lon, arr_lat, arr_lon);
    if total_distance < 1_000.0 {
        return None;
    }

    let distance_progress =
        (haversine_meters(dep_lat, dep_lon, lat, lon) / total_distance).clamp(0.0, 1.0);

    // Blend time-based and distance-based progress when the schedule is
    // known; otherwise distance is all we have.
    let departure = route.actual_departure.or(route.scheduled_departure);
    let arrival = route.scheduled_arrival.or(route.actual_arrival);
    let time_progress = match (departure, arrival) {
        (Some(dep), Some(arr)) if arr > dep => {
            let duration = (arr - dep).num_seconds() as f64;
            let flown = (now - dep).num_seconds() as f64;
            (flown / duration).clamp(0.0, 1.0)
        }
        _ => distance_progress,
    };

    let mut progress =
        TIME_PROGRESS_WEIGHT * time_progress + (1.0 - TIME_PROGRESS_WEIGHT) * distance_progress;

    // Step forward by what the aircraft has flown since last contact
    progress += velocity * elapsed / total_distance;
    progress = progress.clamp(0.0, 1.0);

    Some(great_circle_interpolate(
        dep_lat, dep_lon, arr_lat, arr_lon, progress,
    ))
}

fn predict_altitude(
    state: &AircraftState,
    route: Option<&Route>,
    now: DateTime<Utc>,
    elapsed: f64,
) -> Option<f64> {
    let altitude = state.baro_altitude?;

    // On-ground aircraft never reach here, so a known vertical rate can be
    // extrapolated linearly.
    if let Some(rate) = state.vertical_rate {
        return Some((altitude + rate * elapsed).clamp(0.0, MAX_ALTITUDE_METERS));
    }

    // No rate: lean on the flight phase when the schedule gives us one
    if let Some(route) = route {
        let departure = route.actual_departure.or(route.scheduled_departure);
        let arrival = route.scheduled_arrival.or(route.actual_arrival);
        if let (Some(dep), Some(arr)) = (departure, arrival)
            && arr > dep
        {
            let progress =
                ((now - dep).num_seconds() as f64 / (arr - dep).num_seconds() as f64).clamp(0.0, 1.0);
            let delta = if progress < 0.2 {
                PHASE_RATE_MPS * elapsed
            } else if progress > 0.8 {
                -PHASE_RATE_MPS * elapsed
            } else {
                0.0
            };
            return Some((altitude + delta).clamp(0.0, MAX_ALTITUDE_METERS));
        }
    }

    Some(altitude)
}

/// Confidence in [0.5, 1.0], decaying with age and with route absence.
fn confidence(elapsed: f64, has_route: bool) -> f64 {
    let age_decay = 0.4 * (elapsed / MAX_PREDICTION_AGE_SECONDS as f64).clamp(0.0, 1.0);
    let route_penalty = if has_route { 0.0 } else { 0.1 };
    (1.0 - age_decay - route_penalty).clamp(0.5, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft_states::DataSource;
    use chrono::Duration;
    use uuid::Uuid;

    fn state_aged(age_seconds: i64, now: DateTime<Utc>) -> AircraftState {
        AircraftState {
            icao24: "a1b2c3".to_string(),
            callsign: Some("UAL123".to_string()),
            registration: None,
            latitude: Some(40.0),
            longitude: Some(-74.0),
            baro_altitude: Some(10_000.0),
            geo_altitude: None,
            velocity: Some(250.0),
            true_track: Some(90.0),
            vertical_rate: None,
            on_ground: false,
            squawk: None,
            emergency_status: None,
            category: Some(4),
            aircraft_type: None,
            aircraft_description: None,
            data_source: DataSource::CommercialNetwork,
            source_priority: 20,
            time_position: Some(now.timestamp() - age_seconds),
            last_contact: now.timestamp() - age_seconds,
            ingestion_timestamp: now,
        }
    }

    fn transcon_route(now: DateTime<Utc>) -> Route {
        Route {
            id: Uuid::new_v4(),
            flight_key: "UAL123".to_string(),
            callsign: Some("UAL123".to_string()),
            icao24: None,
            departure_icao: Some("KJFK".to_string()),
            departure_iata: None,
            departure_name: None,
            departure_latitude: Some(40.6413),
            departure_longitude: Some(-73.7781),
            arrival_icao: Some("KLAX".to_string()),
            arrival_iata: None,
            arrival_name: None,
            arrival_latitude: Some(33.9416),
            arrival_longitude: Some(-118.4085),
            scheduled_departure: Some(now - Duration::hours(3)),
            actual_departure: Some(now - Duration::hours(3)),
            scheduled_arrival: Some(now + Duration::hours(3)),
            actual_arrival: None,
            aircraft_type: Some("B738".to_string()),
            progress_percent: Some(50),
            flight_status: Some("En Route".to_string()),
            updated_at: now,
        }
    }

    #[test]
    fn fresh_and_ancient_states_are_ineligible() {
        let now = Utc::now();
        assert!(!eligible(&state_aged(10, now), now));
        assert!(eligible(&state_aged(30, now), now));
        assert!(eligible(&state_aged(600, now), now));
        assert!(!eligible(&state_aged(601, now), now));
    }

    #[test]
    fn rotorcraft_slow_and_grounded_excluded() {
        let now = Utc::now();

        let mut rotor = state_aged(120, now);
        rotor.category = Some(8);
        assert!(!eligible(&rotor, now));

        let mut slow = state_aged(120, now);
        slow.velocity = Some(40.0);
        assert!(!eligible(&slow, now));

        let mut grounded = state_aged(120, now);
        grounded.on_ground = true;
        assert!(!eligible(&grounded, now));
    }

    #[test]
    fn dead_reckoning_three_minute_gap() {
        // 250 m/s due east for 180s: about 45 km, which at 40N is roughly
        // 0.53 degrees of longitude.
        let now = Utc::now();
        let prediction = predict(&state_aged(180, now), None, now).unwrap();

        assert!((prediction.latitude - 40.0).abs() < 0.01);
        let expected_lon = -74.0 + 45_000.0 / (111_000.0 * 40.0_f64.to_radians().cos());
        assert!(
            (prediction.longitude - expected_lon).abs() < 0.01,
            "got {}, want {expected_lon}",
            prediction.longitude
        );
        assert!(prediction.confidence >= 0.5 && prediction.confidence <= 0.9);
    }

    #[test]
    fn dead_reckoning_requires_track() {
        let now = Utc::now();
        let mut state = state_aged(180, now);
        state.true_track = None;
        assert!(predict(&state, None, now).is_none());
    }

    #[test]
    fn great_circle_moves_toward_arrival() {
        let now = Utc::now();
        let route = transcon_route(now);
        let mut state = state_aged(120, now);
        // Mid-country position
        state.latitude = Some(39.0);
        state.longitude = Some(-98.0);

        let prediction = predict(&state, Some(&route), now).unwrap();
        // Prediction lies between the endpoints, west of the last position
        assert!(prediction.longitude < -73.0 && prediction.longitude > -119.0);
        assert!(prediction.latitude > 33.0 && prediction.latitude < 41.0);
        assert!(prediction.confidence > 0.8);
    }

    #[test]
    fn routed_confidence_beats_unrouted() {
        let now = Utc::now();
        let route = transcon_route(now);
        let mut state = state_aged(120, now);
        state.latitude = Some(39.0);
        state.longitude = Some(-98.0);

        let routed = predict(&state, Some(&route), now).unwrap();
        let unrouted = predict(&state, None, now).unwrap();
        assert!(routed.confidence > unrouted.confidence);
    }

    #[test]
    fn altitude_extrapolates_and_clamps() {
        let now = Utc::now();

        let mut climbing = state_aged(100, now);
        climbing.vertical_rate = Some(10.0);
        let prediction = predict(&climbing, None, now).unwrap();
        assert_eq!(prediction.baro_altitude, Some(11_000.0));

        let mut diving = state_aged(600, now);
        diving.vertical_rate = Some(-20.0);
        let prediction = predict(&diving, None, now).unwrap();
        assert_eq!(prediction.baro_altitude, Some(0.0));
    }

    #[test]
    fn confidence_bounds_hold() {
        assert_eq!(confidence(0.0, true), 1.0);
        assert!(confidence(600.0, false) >= 0.5);
        assert!(confidence(300.0, false) < confidence(300.0, true));
    }
}
