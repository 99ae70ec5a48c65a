use nalgebra::{Rotation3, Vector3};

use super::ImuSample;

/// Mean of the IMU samples collected while the platform rests, which can be
/// [`collect`](std::iter::Iterator::collect)ed from an
/// [`Iterator<Item = &ImuSample>`].
///
/// The gyro mean seeds the gyro bias, the accelerometer mean gives the
/// gravity direction and the scale between the sensor unit and m/s².
#[derive(Debug, Clone)]
pub struct ImuInit {
    pub acc_mean: Vector3<f64>,
    pub gyro_mean: Vector3<f64>,
    pub count: usize,
    /// Timestamp of the last sample.
    pub timestamp: f64,
}

impl ImuInit {
    #[inline]
    pub fn acc_norm(&self) -> f64 {
        self.acc_mean.norm()
    }

    /// Rotation taking the IMU frame to a gravity-aligned world, with the
    /// accelerometer mean pointing along world `+z`.
    pub fn gravity_alignment(&self) -> Rotation3<f64> {
        Rotation3::rotation_between(&self.acc_mean, &Vector3::z())
            // anti-parallel: any half turn about a horizontal axis works
            .unwrap_or_else(|| Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI))
    }
}

impl<'a> FromIterator<&'a ImuSample> for Option<ImuInit> {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = &'a ImuSample>,
    {
        let mut iter = iter.into_iter();
        let first = iter.next()?;

        let init = ImuInit {
            acc_mean: first.linear_acceleration,
            gyro_mean: first.angular_velocity,
            count: 1,
            timestamp: first.timestamp,
        };
        Some(iter.fold(init, |mut mean, sample| {
            mean.count += 1;
            let weight = (mean.count as f64).recip();
            mean.acc_mean = mean.acc_mean.lerp(&sample.linear_acceleration, weight);
            mean.gyro_mean = mean.gyro_mean.lerp(&sample.angular_velocity, weight);
            mean.timestamp = sample.timestamp;
            mean
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_running_mean_is_exact() {
        let samples: Vec<_> = (0..4)
            .map(|i| {
                ImuSample::new(
                    i as f64 * 0.01,
                    Vector3::new(i as f64, 0.0, 0.0),
                    Vector3::new(0.0, 0.0, 9.0 + i as f64),
                )
            })
            .collect();
        let init: Option<ImuInit> = samples.iter().collect();
        let init = init.expect("non-empty");

        assert_eq!(init.count, 4);
        assert_relative_eq!(init.gyro_mean, Vector3::new(1.5, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(init.acc_norm(), 10.5, epsilon = 1e-12);
        assert_relative_eq!(init.timestamp, 0.03);
    }

    #[test]
    fn test_gravity_alignment_levels_tilted_imu() {
        let tilt = Rotation3::new(Vector3::new(0.2, -0.1, 0.0));
        let samples = [ImuSample::new(
            0.0,
            Vector3::zeros(),
            tilt.inverse() * Vector3::new(0.0, 0.0, 9.81),
        )];
        let init: Option<ImuInit> = samples.iter().collect();
        let alignment = init.expect("non-empty").gravity_alignment();
        let up = alignment * samples[0].linear_acceleration.normalize();
        assert_relative_eq!(up, Vector3::z(), epsilon = 1e-9);
        assert!(<Option<ImuInit>>::from_iter(std::iter::empty::<&ImuSample>()).is_none());
    }
}
