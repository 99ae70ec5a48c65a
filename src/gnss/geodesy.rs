//! Conversions between ECEF, geodetic and local east-north-up frames on the
//! WGS-84 ellipsoid.

use std::f64::consts::FRAC_PI_2;

use map_3d::Ellipsoid;
use nalgebra::{Matrix3, Rotation3, Vector3};

/// Latitude and longitude in radians, height above the ellipsoid in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Geodetic {
    pub latitude: f64,
    pub longitude: f64,
    pub height: f64,
}

pub fn geodetic_to_ecef(geodetic: &Geodetic) -> Vector3<f64> {
    let (x, y, z) = map_3d::geodetic2ecef(
        geodetic.latitude,
        geodetic.longitude,
        geodetic.height,
        Ellipsoid::WGS84,
    );
    Vector3::new(x, y, z)
}

pub fn ecef_to_geodetic(ecef: &Vector3<f64>) -> Geodetic {
    let (latitude, longitude, height) =
        map_3d::ecef2geodetic(ecef.x, ecef.y, ecef.z, Ellipsoid::WGS84);
    Geodetic {
        latitude,
        longitude,
        height,
    }
}

/// Rotation taking east-north-up vectors at `(latitude, longitude)` into ECEF.
pub fn rotation_ecef_enu(latitude: f64, longitude: f64) -> Rotation3<f64> {
    let axis = |e, n, u| {
        let (x, y, z) = map_3d::enu2uvw(e, n, u, latitude, longitude);
        Vector3::new(x, y, z)
    };
    let matrix = Matrix3::from_columns(&[
        axis(1.0, 0.0, 0.0),
        axis(0.0, 1.0, 0.0),
        axis(0.0, 0.0, 1.0),
    ]);
    Rotation3::from_matrix_unchecked(matrix)
}

/// [`rotation_ecef_enu`] at the geodetic position of an ECEF point.
pub fn rotation_ecef_enu_at(ecef: &Vector3<f64>) -> Rotation3<f64> {
    let geodetic = ecef_to_geodetic(ecef);
    rotation_ecef_enu(geodetic.latitude, geodetic.longitude)
}

/// Elevation and azimuth (radians) of `satellite` seen from `receiver`.
pub fn elevation_azimuth(receiver: &Vector3<f64>, satellite: &Vector3<f64>) -> (f64, f64) {
    let origin = ecef_to_geodetic(receiver);
    let (east, north, up) = map_3d::ecef2enu(
        satellite.x,
        satellite.y,
        satellite.z,
        origin.latitude,
        origin.longitude,
        origin.height,
        Ellipsoid::WGS84,
    );
    let distance = Vector3::new(east, north, up).norm();
    if distance < 1e-9 {
        return (FRAC_PI_2, 0.0);
    }
    ((up / distance).clamp(-1.0, 1.0).asin(), east.atan2(north))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_geodetic_round_trip() {
        for geodetic in [
            Geodetic {
                latitude: 22.3_f64.to_radians(),
                longitude: 114.2_f64.to_radians(),
                height: 30.0,
            },
            Geodetic {
                latitude: -45.0_f64.to_radians(),
                longitude: -70.0_f64.to_radians(),
                height: 2500.0,
            },
            Geodetic {
                latitude: 75.0_f64.to_radians(),
                longitude: 10.0_f64.to_radians(),
                height: -20.0,
            },
        ] {
            let back = ecef_to_geodetic(&geodetic_to_ecef(&geodetic));
            assert_relative_eq!(back.latitude, geodetic.latitude, epsilon = 1e-8);
            assert_relative_eq!(back.longitude, geodetic.longitude, epsilon = 1e-8);
            assert_relative_eq!(back.height, geodetic.height, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_equator_lies_on_the_semi_major_axis() {
        let ecef = geodetic_to_ecef(&Geodetic::default());
        assert_relative_eq!(ecef, Vector3::new(6_378_137.0, 0.0, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn test_enu_rotation_is_orthonormal() {
        let rotation = rotation_ecef_enu(0.7, -2.1);
        let matrix = rotation.matrix();
        assert_relative_eq!(matrix * matrix.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(matrix.determinant(), 1.0, epsilon = 1e-12);
        // east is horizontal
        assert_relative_eq!((rotation * Vector3::x()).z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_up_points_away_from_earth() {
        let receiver = geodetic_to_ecef(&Geodetic {
            latitude: 0.5,
            longitude: 1.0,
            height: 0.0,
        });
        let up = rotation_ecef_enu_at(&receiver) * Vector3::z();
        assert_relative_eq!(up.dot(&receiver.normalize()), 1.0, epsilon = 1e-2);

        let overhead = receiver + up * 20_000_000.0;
        let (elevation, _) = elevation_azimuth(&receiver, &overhead);
        assert_relative_eq!(elevation, FRAC_PI_2, epsilon = 1e-6);

        let north = receiver + rotation_ecef_enu_at(&receiver) * Vector3::new(0.0, 1000.0, 0.0);
        let (elevation, azimuth) = elevation_azimuth(&receiver, &north);
        assert!(elevation.abs() < 1e-3);
        assert_relative_eq!(azimuth, 0.0, epsilon = 1e-6);
    }
}
