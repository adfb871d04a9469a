// Great-circle distance between profile locations.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(uniffi::Record, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Both halves must be present; a profile with only one coordinate has no location.
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        Some(Self::new(latitude?, longitude?))
    }
}

/// Haversine distance in kilometers, or `None` if either location is unknown.
pub fn distance_km(a: Option<Coordinates>, b: Option<Coordinates>) -> Option<f64> {
    let (a, b) = (a?, b?);
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    Some(EARTH_RADIUS_KM * c)
}

pub fn format_distance(distance_km: Option<f64>) -> String {
    match distance_km {
        None => "Distance unknown".to_string(),
        Some(d) if d < 1.0 => format!("{}m away", (d * 1000.0).round() as i64),
        Some(d) => format!("{d:.1}km away"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_meters_and_kilometers() {
        assert_eq!(format_distance(Some(0.5)), "500m away");
        assert_eq!(format_distance(Some(0.0)), "0m away");
        assert_eq!(format_distance(Some(12.34)), "12.3km away");
        assert_eq!(format_distance(Some(1.0)), "1.0km away");
        assert_eq!(format_distance(None), "Distance unknown");
    }

    #[test]
    fn missing_coordinates_yield_none() {
        let paris = Coordinates::new(48.8566, 2.3522);
        assert_eq!(distance_km(Some(paris), None), None);
        assert_eq!(distance_km(None, Some(paris)), None);
        assert_eq!(Coordinates::from_parts(Some(1.0), None), None);
    }

    #[test]
    fn paris_to_london_is_about_344_km() {
        let paris = Coordinates::new(48.8566, 2.3522);
        let london = Coordinates::new(51.5074, -0.1278);
        let d = distance_km(Some(paris), Some(london)).unwrap();
        assert!((d - 343.5).abs() < 1.0, "got {d}");
        let back = distance_km(Some(london), Some(paris)).unwrap();
        assert!((d - back).abs() < 1e-9);
    }

    #[test]
    fn equator_origin_is_a_real_location() {
        let origin = Coordinates::new(0.0, 0.0);
        let d = distance_km(Some(origin), Some(Coordinates::new(0.0, 1.0))).unwrap();
        assert!((d - 111.19).abs() < 0.1, "got {d}");
    }
}
