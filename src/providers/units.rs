//! Unit conversions applied at the provider edge. Everything downstream of
//! the adapters speaks meters, meters per second, and Unix seconds.

pub const FEET_TO_METERS: f64 = 0.3048;
pub const FPM_TO_MPS: f64 = 0.00508;
pub const KNOTS_TO_MPS: f64 = 0.514444;

/// Altitude below which the on-ground heuristic kicks in (100 ft).
pub const GROUND_ALTITUDE_METERS: f64 = 30.48;

/// Ground speed below which the on-ground heuristic kicks in.
pub const GROUND_SPEED_KNOTS: f64 = 50.0;

pub fn feet_to_meters(feet: f64) -> f64 {
    feet * FEET_TO_METERS
}

pub fn fpm_to_mps(fpm: f64) -> f64 {
    fpm * FPM_TO_MPS
}

pub fn knots_to_mps(knots: f64) -> f64 {
    knots * KNOTS_TO_MPS
}

/// When a provider omits the on-ground flag: low and slow means parked.
pub fn on_ground_heuristic(altitude_meters: Option<f64>, velocity_knots: Option<f64>) -> bool {
    let low = matches!(altitude_meters, Some(alt) if alt < GROUND_ALTITUDE_METERS);
    let slow = matches!(velocity_knots, Some(v) if v < GROUND_SPEED_KNOTS);
    low || slow
}

/// Map an ADS-B emitter category code (`A0..A7`, `B0..B7`, `C0..C3`) to the
/// canonical 0..19 integer. The zero codes of each set carry no category
/// information and collapse to 1; unknown codes yield null.
pub fn emitter_category_code(code: &str) -> Option<i32> {
    match code {
        "A0" | "B0" | "C0" => Some(1),
        "A1" => Some(2),  // Light
        "A2" => Some(3),  // Small
        "A3" => Some(4),  // Large
        "A4" => Some(5),  // High vortex large
        "A5" => Some(6),  // Heavy
        "A6" => Some(7),  // High performance
        "A7" => Some(8),  // Rotorcraft
        "B1" => Some(9),  // Glider / sailplane
        "B2" => Some(10), // Lighter-than-air
        "B3" => Some(11), // Parachutist / skydiver
        "B4" => Some(12), // Ultralight / hang-glider
        "B5" => Some(13), // Reserved
        "B6" => Some(14), // UAV
        "B7" => Some(15), // Space vehicle
        "C1" => Some(16), // Surface: emergency vehicle
        "C2" => Some(17), // Surface: service vehicle
        "C3" => Some(18), // Point obstacle
        _ => None,
    }
}

/// Canonical category for a rotorcraft, excluded from trajectory prediction.
pub const CATEGORY_ROTORCRAFT: i32 = 8;
