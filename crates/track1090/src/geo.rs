//! Spherical geometry helpers for the position plausibility checks.

/// Earth radius in meters.
const EARTH_RADIUS: f64 = 6_371_000.0;

fn to_rad(degrees: f64) -> f64 {
    degrees * (std::f64::consts::PI / 180.0)
}

/**
 * Great circle distance between two points, in meters.
 *
 * With `approx` set, use the equirectangular approximation: good enough for
 * the range checks this crate performs (hundreds of kilometers at most) and
 * noticeably cheaper than the full haversine.
 */
pub fn greatcircle(
    lat0: f64,
    lon0: f64,
    lat1: f64,
    lon1: f64,
    approx: bool,
) -> f64 {
    let lat0 = to_rad(lat0);
    let lon0 = to_rad(lon0);
    let lat1 = to_rad(lat1);
    let lon1 = to_rad(lon1);

    let d_lat = lat1 - lat0;
    let d_lon = lon1 - lon0;

    if approx {
        let x = d_lon * libm::cos((lat0 + lat1) / 2.0);
        return EARTH_RADIUS * libm::sqrt(d_lat * d_lat + x * x);
    }

    let a = libm::sin(d_lat / 2.0) * libm::sin(d_lat / 2.0)
        + libm::cos(lat0)
            * libm::cos(lat1)
            * libm::sin(d_lon / 2.0)
            * libm::sin(d_lon / 2.0);
    let c = 2.0 * libm::atan2(libm::sqrt(a), libm::sqrt(1.0 - a));
    EARTH_RADIUS * c
}

/// Initial bearing from the first to the second point, degrees in [0, 360).
pub fn bearing(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> f64 {
    let lat0 = to_rad(lat0);
    let lat1 = to_rad(lat1);
    let d_lon = to_rad(lon1 - lon0);
    let y = libm::sin(d_lon) * libm::cos(lat1);
    let x = libm::cos(lat0) * libm::sin(lat1)
        - libm::sin(lat0) * libm::cos(lat1) * libm::cos(d_lon);
    let deg = libm::atan2(y, x) * (180.0 / std::f64::consts::PI);
    (deg + 360.0) % 360.0
}

/**
 * Coordinates that can only come from a broken encoder: out of range values,
 * the null island neighborhood and the equatorial sentinels some feeds emit
 * when they have no fix.
 */
pub fn bogus_lat_lon(lat: f64, lon: f64) -> bool {
    if libm::fabs(lat) >= 90.0 || libm::fabs(lon) >= 180.0 {
        return true;
    }
    if lat == 0.0 && (lon == -90.0 || lon == 90.0 || lon == 0.0) {
        return true;
    }
    if libm::fabs(lat) < 0.01 && libm::fabs(lon) < 0.01 {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn haversine_known_distance() {
        // Toulouse-Blagnac to Paris-Charles de Gaulle, about 590 km
        let d = greatcircle(43.6291, 1.3638, 49.0097, 2.5479, false);
        assert_relative_eq!(d, 600_000.0, max_relative = 0.02);
    }

    #[test]
    fn approximation_close_to_haversine_at_short_range() {
        let d0 = greatcircle(50.0, 8.0, 50.5, 8.5, false);
        let d1 = greatcircle(50.0, 8.0, 50.5, 8.5, true);
        assert_relative_eq!(d0, d1, max_relative = 1e-3);
    }

    #[test]
    fn symmetry() {
        let ab = greatcircle(10.0, 20.0, 30.0, 40.0, false);
        let ba = greatcircle(30.0, 40.0, 10.0, 20.0, false);
        assert!((ab - ba).abs() < 1e-3, "asymmetry {}", (ab - ba).abs());
    }

    #[test]
    fn zero_distance() {
        assert_eq!(greatcircle(45.0, 5.0, 45.0, 5.0, false), 0.0);
    }

    #[test]
    fn bearing_cardinal_directions() {
        assert_relative_eq!(bearing(50.0, 8.0, 51.0, 8.0), 0.0, epsilon = 0.1);
        assert_relative_eq!(
            bearing(50.0, 8.0, 49.0, 8.0),
            180.0,
            epsilon = 0.1
        );
        assert_relative_eq!(
            bearing(0.0, 8.0, 0.0, 9.0),
            90.0,
            epsilon = 0.1
        );
    }

    #[test]
    fn bogus_coordinates() {
        assert!(bogus_lat_lon(90.0, 10.0));
        assert!(bogus_lat_lon(10.0, 180.0));
        assert!(bogus_lat_lon(0.0, 0.0));
        assert!(bogus_lat_lon(0.0, 90.0));
        assert!(bogus_lat_lon(0.0, -90.0));
        assert!(bogus_lat_lon(0.005, 0.005));
        assert!(!bogus_lat_lon(43.6, 1.36));
        assert!(!bogus_lat_lon(0.0, 30.0));
    }
}
