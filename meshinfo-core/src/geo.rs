//! Great-circle distance between positions.

use crate::protocol::Position;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in kilometres.
pub fn distance_km(a: &Position, b: &Position) -> f64 {
    let (lat1, lon1) = (a.latitude().to_radians(), a.longitude().to_radians());
    let (lat2, lon2) = (b.latitude().to_radians(), b.longitude().to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}
