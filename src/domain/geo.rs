//! Great-circle geometry on a spherical Earth

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Point displaced by `north_m` / `east_m` meters (small offsets only)
    pub fn offset_m(&self, north_m: f64, east_m: f64) -> Coordinate {
        let dlat = (north_m / EARTH_RADIUS_M).to_degrees();
        let cos_lat = self.latitude.to_radians().cos().max(1e-12);
        let dlon = (east_m / (EARTH_RADIUS_M * cos_lat)).to_degrees();
        Coordinate::new(self.latitude + dlat, self.longitude + dlon)
    }
}

/// Haversine distance between two coordinates in meters
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Clamp guards asin against rounding just above 1.0
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        let p = Coordinate::new(64.1466, -21.9426);
        assert_eq!(haversine_m(p, p), 0.0);
    }

    #[test]
    fn test_one_degree_latitude() {
        let d = haversine_m(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn test_symmetric() {
        let a = Coordinate::new(51.5007, -0.1246);
        let b = Coordinate::new(40.6892, -74.0445);
        let ab = haversine_m(a, b);
        assert!((ab - haversine_m(b, a)).abs() < 1e-6);
        // London to New York is roughly 5570 km
        assert!((ab / 1000.0 - 5574.0).abs() < 20.0, "got {ab}");
    }

    #[test]
    fn test_offset_round_trip_distance() {
        let origin = Coordinate::new(45.0, 10.0);
        let north = origin.offset_m(150.0, 0.0);
        let east = origin.offset_m(0.0, 150.0);
        assert!((haversine_m(origin, north) - 150.0).abs() < 0.01);
        assert!((haversine_m(origin, east) - 150.0).abs() < 0.5);
    }

    #[test]
    fn test_validity() {
        assert!(Coordinate::new(0.0, 0.0).is_valid());
        assert!(!Coordinate::new(91.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, -180.5).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }
}
