//! Spherical-earth helpers shared by the bounds planner and the trajectory
//! predictor. All distances are meters, all angles degrees unless noted.

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Axis-aligned bounding box in WGS-84 degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lon_min: f64,
    pub lat_max: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    /// Validates ordering and range. Antimeridian-crossing boxes
    /// (`lon_min > lon_max`) are rejected, not split.
    pub fn new(lat_min: f64, lon_min: f64, lat_max: f64, lon_max: f64) -> Result<Self, String> {
        for (name, v) in [
            ("latmin", lat_min),
            ("lonmin", lon_min),
            ("latmax", lat_max),
            ("lonmax", lon_max),
        ] {
            if !v.is_finite() {
                return Err(format!("{name} is not a finite number"));
            }
        }
        if !(-90.0..=90.0).contains(&lat_min) || !(-90.0..=90.0).contains(&lat_max) {
            return Err("latitude out of range [-90, 90]".to_string());
        }
        if !(-180.0..=180.0).contains(&lon_min) || !(-180.0..=180.0).contains(&lon_max) {
            return Err("longitude out of range [-180, 180]".to_string());
        }
        if lat_min > lat_max {
            return Err("latmin greater than latmax".to_string());
        }
        if lon_min > lon_max {
            return Err("bounding boxes crossing the antimeridian are not supported".to_string());
        }
        Ok(Self {
            lat_min,
            lon_min,
            lat_max,
            lon_max,
        })
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_min && lat <= self.lat_max && lon >= self.lon_min && lon <= self.lon_max
    }

    /// Degenerate boxes produce no results and skip the store entirely.
    pub fn is_empty(&self) -> bool {
        self.lat_min == self.lat_max || self.lon_min == self.lon_max
    }
}

/// Great-circle distance between two points, in meters.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Interpolate along the great circle from point 1 to point 2 at fraction
/// `f` in [0, 1], using the standard slerp formula. Returns (lat, lon).
pub fn great_circle_interpolate(
    lat1: f64,
    lon1: f64,
    lat2: f64,
    lon2: f64,
    f: f64,
) -> (f64, f64) {
    let phi1 = lat1.to_radians();
    let lambda1 = lon1.to_radians();
    let phi2 = lat2.to_radians();
    let lambda2 = lon2.to_radians();

    let delta = haversine_meters(lat1, lon1, lat2, lon2) / EARTH_RADIUS_METERS;
    if delta < 1e-12 {
        return (lat1, lon1);
    }

    let a = ((1.0 - f) * delta).sin() / delta.sin();
    let b = (f * delta).sin() / delta.sin();

    let x = a * phi1.cos() * lambda1.cos() + b * phi2.cos() * lambda2.cos();
    let y = a * phi1.cos() * lambda1.sin() + b * phi2.cos() * lambda2.sin();
    let z = a * phi1.sin() + b * phi2.sin();

    let lat = z.atan2((x * x + y * y).sqrt()).to_degrees();
    let lon = y.atan2(x).to_degrees();
    (lat, lon)
}

/// Advance a position along a track using a local flat-earth projection.
/// Good enough for the short horizons dead reckoning is used for.
pub fn dead_reckon(lat: f64, lon: f64, track_degrees: f64, distance_meters: f64) -> (f64, f64) {
    const METERS_PER_DEGREE_LAT: f64 = 111_000.0;

    let track = track_degrees.to_radians();
    let north = distance_meters * track.cos();
    let east = distance_meters * track.sin();

    let new_lat = lat + north / METERS_PER_DEGREE_LAT;
    let meters_per_degree_lon = METERS_PER_DEGREE_LAT * lat.to_radians().cos();
    let new_lon = if meters_per_degree_lon.abs() < 1.0 {
        lon
    } else {
        lon + east / meters_per_degree_lon
    };

    (new_lat.clamp(-90.0, 90.0), wrap_longitude(new_lon))
}

fn wrap_longitude(lon: f64) -> f64 {
    let mut wrapped = lon;
    while wrapped > 180.0 {
        wrapped -= 360.0;
    }
    while wrapped < -180.0 {
        wrapped += 360.0;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_rejects_antimeridian_crossing() {
        assert!(BoundingBox::new(10.0, 170.0, 20.0, -170.0).is_err());
    }

    #[test]
    fn bbox_rejects_out_of_range() {
        assert!(BoundingBox::new(-95.0, 0.0, 10.0, 10.0).is_err());
        assert!(BoundingBox::new(0.0, -190.0, 10.0, 10.0).is_err());
        assert!(BoundingBox::new(f64::NAN, 0.0, 10.0, 10.0).is_err());
        assert!(BoundingBox::new(20.0, 0.0, 10.0, 10.0).is_err());
    }

    #[test]
    fn bbox_empty_when_degenerate() {
        let bbox = BoundingBox::new(40.0, -74.0, 40.0, -73.0).unwrap();
        assert!(bbox.is_empty());
        let bbox = BoundingBox::new(39.0, -75.0, 41.0, -73.0).unwrap();
        assert!(!bbox.is_empty());
    }

    #[test]
    fn bbox_contains_boundary_points() {
        let bbox = BoundingBox::new(39.0, -75.0, 41.0, -73.0).unwrap();
        assert!(bbox.contains(39.0, -75.0));
        assert!(bbox.contains(41.0, -73.0));
        assert!(bbox.contains(40.0, -74.0));
        assert!(!bbox.contains(38.9, -74.0));
        assert!(!bbox.contains(40.0, -72.9));
    }

    #[test]
    fn haversine_known_distance() {
        // JFK to LAX, roughly 3983 km
        let d = haversine_meters(40.6413, -73.7781, 33.9416, -118.4085);
        assert!((d - 3_983_000.0).abs() < 15_000.0, "got {d}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_meters(40.0, -74.0, 40.0, -74.0), 0.0);
    }

    #[test]
    fn great_circle_endpoints() {
        let (lat, lon) = great_circle_interpolate(40.0, -74.0, 34.0, -118.0, 0.0);
        assert!((lat - 40.0).abs() < 1e-9);
        assert!((lon + 74.0).abs() < 1e-9);

        let (lat, lon) = great_circle_interpolate(40.0, -74.0, 34.0, -118.0, 1.0);
        assert!((lat - 34.0).abs() < 1e-9);
        assert!((lon + 118.0).abs() < 1e-9);
    }

    #[test]
    fn great_circle_midpoint_is_between() {
        let (lat, lon) = great_circle_interpolate(40.0, -74.0, 34.0, -118.0, 0.5);
        assert!(lat > 34.0 && lat < 42.0);
        assert!(lon > -118.0 && lon < -74.0);
        // The midpoint of a great circle arcs poleward of the rhumb line
        assert!(lat > 37.0);
    }

    #[test]
    fn dead_reckon_due_east_at_40n() {
        // 45 km east at 40N: about 0.53 degrees of longitude
        let (lat, lon) = dead_reckon(40.0, -74.0, 90.0, 45_000.0);
        assert!((lat - 40.0).abs() < 1e-6);
        let expected = -74.0 + 45_000.0 / (111_000.0 * 40.0_f64.to_radians().cos());
        assert!((lon - expected).abs() < 1e-6, "got {lon}, want {expected}");
    }

    #[test]
    fn dead_reckon_due_north() {
        let (lat, lon) = dead_reckon(40.0, -74.0, 0.0, 111_000.0);
        assert!((lat - 41.0).abs() < 1e-6);
        assert!((lon + 74.0).abs() < 1e-6);
    }

    #[test]
    fn dead_reckon_wraps_longitude() {
        let (_, lon) = dead_reckon(0.0, 179.9, 90.0, 50_000.0);
        assert!(lon < -179.0);
    }
}
