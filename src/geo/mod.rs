use crate::models::presence::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let from_lat = from.lat.to_radians();
    let to_lat = to.lat.to_radians();
    let half_dlat = ((to.lat - from.lat).to_radians() / 2.0).sin();
    let half_dlng = ((to.lng - from.lng).to_radians() / 2.0).sin();

    let h = half_dlat * half_dlat + from_lat.cos() * to_lat.cos() * half_dlng * half_dlng;

    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Rejects NaN and out-of-range fixes before they reach the dispatcher.
pub fn is_valid(point: &GeoPoint) -> bool {
    point.lat.is_finite()
        && point.lng.is_finite()
        && (-90.0..=90.0).contains(&point.lat)
        && (-180.0..=180.0).contains(&point.lng)
}

#[cfg(test)]
mod tests {
    use super::{haversine_km, is_valid};
    use crate::models::presence::GeoPoint;

    #[test]
    fn same_point_has_no_distance() {
        let depot = GeoPoint {
            lat: 40.4168,
            lng: -3.7038,
        };
        assert!(haversine_km(&depot, &depot) < 1e-9);
    }

    #[test]
    fn madrid_to_barcelona_is_around_505_km() {
        let madrid = GeoPoint {
            lat: 40.4168,
            lng: -3.7038,
        };
        let barcelona = GeoPoint {
            lat: 41.3874,
            lng: 2.1686,
        };
        let distance = haversine_km(&madrid, &barcelona);
        assert!((distance - 505.0).abs() < 10.0);
    }

    #[test]
    fn out_of_range_fix_is_invalid() {
        assert!(!is_valid(&GeoPoint { lat: 91.0, lng: 0.0 }));
        assert!(!is_valid(&GeoPoint {
            lat: f64::NAN,
            lng: 0.0
        }));
        assert!(is_valid(&GeoPoint {
            lat: -33.86,
            lng: 151.2
        }));
    }
}
