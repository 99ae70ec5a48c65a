use nalgebra::{DMatrix, DVector, Vector3};

use super::GnssSystem;

/// A pseudorange already corrected for the satellite clock and atmosphere,
/// so that `range = ‖sv − P‖ + clock[system]`.
#[derive(Debug, Clone, Copy)]
pub struct RangeObservation {
    pub system: GnssSystem,
    pub satellite: Vector3<f64>,
    pub range: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SppSolution {
    pub position: Vector3<f64>,
    /// Receiver clock offset in meters for each constellation that was seen.
    pub clocks: [Option<f64>; GnssSystem::COUNT],
    pub iterations: usize,
}

const MAX_ITERATIONS: usize = 16;
const CONVERGED: f64 = 1e-4;

/// Single point positioning by Gauss–Newton on position plus one clock per
/// constellation.
pub fn solve(observations: &[RangeObservation], initial: &Vector3<f64>) -> Option<SppSolution> {
    let systems: Vec<_> = GnssSystem::ALL
        .into_iter()
        .filter(|system| observations.iter().any(|obs| obs.system == *system))
        .collect();
    let unknowns = 3 + systems.len();
    if observations.len() < unknowns {
        return None;
    }
    let clock_column = |system: GnssSystem| systems.iter().position(|s| *s == system);

    let mut position = *initial;
    let mut clocks = DVector::<f64>::zeros(systems.len());

    for iteration in 0..MAX_ITERATIONS {
        let mut jacobian = DMatrix::zeros(observations.len(), unknowns);
        let mut residual = DVector::zeros(observations.len());

        for (row, obs) in observations.iter().enumerate() {
            let column = clock_column(obs.system)?;
            let line_of_sight = obs.satellite - position;
            let distance = line_of_sight.norm();
            let unit = line_of_sight / distance;

            residual[row] = obs.range - (distance + clocks[column]);
            jacobian
                .fixed_view_mut::<1, 3>(row, 0)
                .copy_from(&(-unit.transpose()));
            jacobian[(row, 3 + column)] = 1.0;
        }

        let normal = jacobian.transpose() * &jacobian;
        let step = normal.cholesky()?.solve(&(jacobian.transpose() * residual));
        if step.iter().any(|x| !x.is_finite()) {
            return None;
        }

        position += step.fixed_rows::<3>(0);
        clocks += step.rows(3, systems.len());

        if step.amax() < CONVERGED {
            let mut solved = [None; GnssSystem::COUNT];
            for (system, clock) in systems.iter().zip(clocks.iter()) {
                solved[system.index()] = Some(*clock);
            }
            return Some(SppSolution {
                position,
                clocks: solved,
                iterations: iteration + 1,
            });
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gnss::geodesy::{Geodetic, geodetic_to_ecef, rotation_ecef_enu_at};

    /// A constellation spread over the sky of `receiver`, 20 000 km away.
    pub(crate) fn sky(receiver: &Vector3<f64>) -> Vec<Vector3<f64>> {
        let rotation = rotation_ecef_enu_at(receiver);
        [
            (0.0_f64, 80.0_f64),
            (45.0, 30.0),
            (120.0, 50.0),
            (200.0, 25.0),
            (260.0, 60.0),
            (310.0, 35.0),
            (20.0, 20.0),
            (160.0, 70.0),
        ]
        .into_iter()
        .map(|(azimuth, elevation)| {
            let (azimuth, elevation) = (azimuth.to_radians(), elevation.to_radians());
            let enu = nalgebra::Vector3::new(
                elevation.cos() * azimuth.sin(),
                elevation.cos() * azimuth.cos(),
                elevation.sin(),
            );
            receiver + rotation * enu * 20_000_000.0
        })
        .collect()
    }

    #[test]
    fn test_spp_recovers_position_and_clocks() {
        let receiver = geodetic_to_ecef(&Geodetic {
            latitude: 0.39,
            longitude: 1.99,
            height: 40.0,
        });
        let observations: Vec<_> = sky(&receiver)
            .into_iter()
            .enumerate()
            .map(|(i, satellite)| {
                let system = if i % 2 == 0 { GnssSystem::Gps } else { GnssSystem::BeiDou };
                let clock = if system == GnssSystem::Gps { 120.0 } else { -35.0 };
                RangeObservation {
                    system,
                    satellite,
                    range: (satellite - receiver).norm() + clock,
                }
            })
            .collect();

        let solution = solve(&observations, &Vector3::zeros()).expect("converges");
        assert!((solution.position - receiver).norm() < 1e-3);
        assert!((solution.clocks[GnssSystem::Gps.index()].unwrap_or_default() - 120.0).abs() < 1e-3);
        assert!((solution.clocks[GnssSystem::BeiDou.index()].unwrap_or_default() + 35.0).abs() < 1e-3);
        assert_eq!(solution.clocks[GnssSystem::Glonass.index()], None);
    }

    #[test]
    fn test_spp_needs_enough_satellites() {
        let receiver = geodetic_to_ecef(&Geodetic::default());
        let observations: Vec<_> = sky(&receiver)
            .into_iter()
            .take(3)
            .map(|satellite| RangeObservation {
                system: GnssSystem::Gps,
                satellite,
                range: (satellite - receiver).norm(),
            })
            .collect();
        assert!(solve(&observations, &Vector3::zeros()).is_none());
    }
}
