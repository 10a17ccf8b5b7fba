//! Spherical geometry and the straight-ray travel-time model.

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in km (haversine).
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Initial bearing from point 1 to point 2, degrees in [0, 360).
pub fn azimuth(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let x = dlon.sin() * lat2_rad.cos();
    let y = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * dlon.cos();
    let az = x.atan2(y).to_degrees();
    (az + 360.0) % 360.0
}

/// P-wave travel time through a homogeneous half-space (straight ray).
pub fn compute_travel_time(distance_km: f64, depth_km: f64, vp_km_s: f64) -> f64 {
    let hypocentral_distance = (distance_km * distance_km + depth_km * depth_km).sqrt();
    hypocentral_distance / vp_km_s
}

/// S-wave travel time through a homogeneous half-space (straight ray).
pub fn compute_travel_time_s(distance_km: f64, depth_km: f64, vs_km_s: f64) -> f64 {
    let hypocentral_distance = (distance_km * distance_km + depth_km * depth_km).sqrt();
    hypocentral_distance / vs_km_s
}

/// Largest azimuthal gap over a circular sort of the station azimuths,
/// including the wrap-around gap. Fewer than two stations: 360.
pub fn azimuthal_gap(station_azimuths: &[f64]) -> f64 {
    if station_azimuths.len() < 2 {
        return 360.0;
    }
    let mut sorted = station_azimuths.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut largest = 360.0 + sorted[0] - sorted[sorted.len() - 1];
    for pair in sorted.windows(2) {
        largest = largest.max(pair[1] - pair[0]);
    }
    largest
}

/// Secondary azimuthal gap: the largest gap left after removing any single
/// station. Fewer than three stations: 360.
pub fn secondary_azimuthal_gap(station_azimuths: &[f64]) -> f64 {
    if station_azimuths.len() < 3 {
        return 360.0;
    }
    let mut sorted = station_azimuths.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mut largest = 0.0f64;
    for i in 0..n {
        let next = (i + 2) % n;
        let gap = if next > i {
            sorted[next] - sorted[i]
        } else {
            360.0 + sorted[next] - sorted[i]
        };
        largest = largest.max(gap);
    }
    largest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_is_zero_at_identical_points() {
        assert!(haversine_distance(47.5, 19.05, 47.5, 19.05).abs() < 1e-9);
    }

    #[test]
    fn haversine_is_symmetric() {
        let d1 = haversine_distance(47.5, 19.05, 48.2, 16.37);
        let d2 = haversine_distance(48.2, 16.37, 47.5, 19.05);
        assert!((d1 - d2).abs() < 1e-9);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = haversine_distance(47.0, 19.0, 48.0, 19.0);
        assert!((d - 111.19).abs() < 0.5);
    }

    #[test]
    fn azimuth_cardinal_directions() {
        let north = azimuth(47.0, 19.0, 48.0, 19.0);
        let east = azimuth(47.0, 19.0, 47.0, 20.0);
        let south = azimuth(48.0, 19.0, 47.0, 19.0);
        let west = azimuth(47.0, 20.0, 47.0, 19.0);
        assert!(north.abs() < 1.0 || (north - 360.0).abs() < 1.0);
        assert!((east - 90.0).abs() < 1.0);
        assert!((south - 180.0).abs() < 1.0);
        assert!((west - 270.0).abs() < 1.0);
    }

    #[test]
    fn travel_time_uses_hypocentral_distance() {
        // 30 km epicentral, 40 km deep → 50 km slant at 5 km/s = 10 s
        let tt = compute_travel_time(30.0, 40.0, 5.0);
        assert!((tt - 10.0).abs() < 1e-9);
        let tt_s = compute_travel_time_s(30.0, 40.0, 2.5);
        assert!((tt_s - 20.0).abs() < 1e-9);
    }

    #[test]
    fn azimuthal_gap_degenerate_cases() {
        assert_eq!(azimuthal_gap(&[]), 360.0);
        assert_eq!(azimuthal_gap(&[123.0]), 360.0);
    }

    #[test]
    fn azimuthal_gap_even_coverage() {
        let gap = azimuthal_gap(&[0.0, 90.0, 180.0, 270.0]);
        assert!((gap - 90.0).abs() < 1e-9);
    }

    #[test]
    fn azimuthal_gap_includes_the_wrap() {
        // Cluster around north: the wrap gap dominates.
        let gap = azimuthal_gap(&[350.0, 10.0, 20.0]);
        assert!((gap - 330.0).abs() < 1e-9);
    }

    #[test]
    fn secondary_gap_is_at_least_the_primary() {
        let azimuths = [5.0, 95.0, 190.0, 280.0];
        assert!(secondary_azimuthal_gap(&azimuths) >= azimuthal_gap(&azimuths));
        assert_eq!(secondary_azimuthal_gap(&[0.0, 90.0]), 360.0);
    }
}
