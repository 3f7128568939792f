use serde::{Deserialize, Serialize};

/// Mean earth radius used for great-circle distances (meters).
///
/// Same value the browser map engine uses for its `distanceTo`, so distances
/// agree with what users measure on the map.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Geographic position in degrees.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and inside `[-90, 90] x [-180, 180]`.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    pub fn distance_m(&self, other: &Self) -> f64 {
        haversine_m(*self, *other)
    }
}

/// Great-circle distance between two positions (meters).
pub fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}
