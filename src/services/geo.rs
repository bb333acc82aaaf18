//! Geographic calculations

use crate::types::Coordinates;

/// Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Calculate Haversine distance between two points in kilometers
pub fn haversine_distance(from: &Coordinates, to: &Coordinates) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lng - from.lng).to_radians();

    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Estimate road distance from straight-line distance
pub fn road_distance(from: &Coordinates, to: &Coordinates, road_coefficient: f64) -> f64 {
    haversine_distance(from, to) * road_coefficient
}

/// Travel time in minutes for a distance at a constant speed
pub fn travel_time_minutes(distance_km: f64, average_speed_kmh: f64) -> f64 {
    distance_km / average_speed_kmh * 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owen_sound() -> Coordinates {
        Coordinates { lat: 44.5690, lng: -80.9406 }
    }

    fn toronto() -> Coordinates {
        Coordinates { lat: 43.6532, lng: -79.3832 }
    }

    #[test]
    fn test_haversine_owen_sound_toronto() {
        let distance = haversine_distance(&owen_sound(), &toronto());

        // Owen Sound to Toronto is approximately 160 km straight line
        assert!((distance - 160.0).abs() < 10.0, "got {} km", distance);
    }

    #[test]
    fn test_haversine_same_point() {
        let point = Coordinates { lat: 50.0, lng: 14.0 };
        let distance = haversine_distance(&point, &point);
        assert!((distance - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_haversine_is_symmetric() {
        let a = haversine_distance(&owen_sound(), &toronto());
        let b = haversine_distance(&toronto(), &owen_sound());
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn test_road_distance_applies_coefficient() {
        let road = road_distance(&owen_sound(), &toronto(), 1.3);
        let straight = haversine_distance(&owen_sound(), &toronto());

        assert!((road / straight - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_travel_time() {
        assert!((travel_time_minutes(120.0, 80.0) - 90.0).abs() < 1e-9);
        assert_eq!(travel_time_minutes(0.0, 80.0), 0.0);
    }
}
