//! crates/guardian_core/src/geo.rs
//!
//! Great-circle distance and bearing on a spherical Earth.

use crate::domain::GeoPoint;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two points, in metres.
pub fn haversine_distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // min() guards against h drifting just above 1.0 for antipodal points.
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_M * c
}

/// Initial bearing from `a` towards `b`, in degrees clockwise from north (0..360).
pub fn initial_bearing_deg(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let y = d_lng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lng.cos();
    normalize_degrees(y.atan2(x).to_degrees())
}

/// Wraps any angle into `[0, 360)`.
pub fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng).unwrap()
    }

    #[test]
    fn distance_to_self_is_zero() {
        let here = p(48.8566, 2.3522);
        assert_eq!(haversine_distance_m(here, here), 0.0);
    }

    #[test]
    fn paris_to_london_is_about_344_km() {
        let d = haversine_distance_m(p(48.8566, 2.3522), p(51.5074, -0.1278));
        assert!((d - 343_500.0).abs() < 1_500.0, "got {}", d);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = haversine_distance_m(p(0.0, 0.0), p(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0, "got {}", d);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = p(-33.87, 151.21);
        let b = p(35.68, 139.69);
        let ab = haversine_distance_m(a, b);
        let ba = haversine_distance_m(b, a);
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn cardinal_bearings() {
        let origin = p(0.0, 0.0);
        assert!((initial_bearing_deg(origin, p(1.0, 0.0)) - 0.0).abs() < 1e-9);
        assert!((initial_bearing_deg(origin, p(0.0, 1.0)) - 90.0).abs() < 1e-9);
        assert!((initial_bearing_deg(origin, p(-1.0, 0.0)) - 180.0).abs() < 1e-9);
        assert!((initial_bearing_deg(origin, p(0.0, -1.0)) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_wraps_negative_angles() {
        assert_eq!(normalize_degrees(-90.0), 270.0);
        assert_eq!(normalize_degrees(720.0), 0.0);
    }
}
