//! Klobuchar broadcast ionosphere model.

use std::f64::consts::PI;

use super::{SPEED_OF_LIGHT, geodesy::Geodetic, observation::IonoParams};

const SECONDS_PER_WEEK: f64 = 604_800.0;
const SECONDS_PER_DAY: f64 = 86_400.0;
const NIGHT_DELAY: f64 = 5e-9;

/// L1 slant ionospheric delay in meters.
///
/// Angles are in radians, `gnss_time` is GNSS time in seconds and only its
/// time of week matters.
pub fn klobuchar_delay(
    params: &IonoParams,
    receiver: &Geodetic,
    azimuth: f64,
    elevation: f64,
    gnss_time: f64,
) -> f64 {
    // the broadcast model works in semicircles
    let elevation_sc = elevation.max(0.0) / PI;
    let psi = 0.0137 / (elevation_sc + 0.11) - 0.022;

    let phi_i = (receiver.latitude / PI + psi * azimuth.cos()).clamp(-0.416, 0.416);
    let lambda_i = receiver.longitude / PI + psi * azimuth.sin() / (phi_i * PI).cos();
    let phi_m = phi_i + 0.064 * ((lambda_i - 1.617) * PI).cos();

    let time_of_week = gnss_time.rem_euclid(SECONDS_PER_WEEK);
    let local_time = (43_200.0 * lambda_i + time_of_week).rem_euclid(SECONDS_PER_DAY);

    let slant = 1.0 + 16.0 * (0.53 - elevation_sc).powi(3);

    let polynomial = |coefficients: &[f64; 4]| {
        coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, coefficient| acc * phi_m + coefficient)
    };
    let amplitude = polynomial(&params.alpha).max(0.0);
    let period = polynomial(&params.beta).max(72_000.0);

    let x = 2.0 * PI * (local_time - 50_400.0) / period;
    let vertical = if x.abs() < 1.57 {
        NIGHT_DELAY + amplitude * (1.0 - x * x / 2.0 + x.powi(4) / 24.0)
    } else {
        NIGHT_DELAY
    };

    SPEED_OF_LIGHT * slant * vertical
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: IonoParams = IonoParams {
        alpha: [0.1118e-7, -0.7451e-8, -0.5961e-7, 0.1192e-6],
        beta: [0.1167e6, -0.2294e6, -0.1311e6, 0.1049e7],
    };

    #[test]
    fn test_delay_positive_and_bounded() {
        let receiver = Geodetic {
            latitude: 22.3_f64.to_radians(),
            longitude: 114.2_f64.to_radians(),
            height: 0.0,
        };
        for elevation_deg in [5.0, 15.0, 45.0, 90.0] {
            for azimuth_deg in [0.0, 90.0, 200.0] {
                for time in [0.0, 20_000.0, 50_400.0, 300_000.0] {
                    let delay = klobuchar_delay(
                        &PARAMS,
                        &receiver,
                        f64::to_radians(azimuth_deg),
                        f64::to_radians(elevation_deg),
                        time,
                    );
                    assert!(delay > 0.0);
                    assert!(delay < 100.0, "delay {delay} too large");
                }
            }
        }
    }

    #[test]
    fn test_low_satellites_see_more_ionosphere() {
        let receiver = Geodetic::default();
        let low = klobuchar_delay(&PARAMS, &receiver, 0.0, 10_f64.to_radians(), 50_400.0);
        let high = klobuchar_delay(&PARAMS, &receiver, 0.0, 80_f64.to_radians(), 50_400.0);
        assert!(low > high);
    }

    #[test]
    fn test_zero_coefficients_give_night_delay() {
        let delay = klobuchar_delay(
            &IonoParams::default(),
            &Geodetic::default(),
            0.0,
            std::f64::consts::FRAC_PI_2,
            0.0,
        );
        // F = 1 + 16 (0.53 - 0.5)^3 at zenith
        let slant = 1.0 + 16.0 * 0.03_f64.powi(3);
        assert!((delay - SPEED_OF_LIGHT * NIGHT_DELAY * slant).abs() < 1e-9);
    }
}
