//! Residuals and Jacobians of the GNSS factors.
//!
//! Every factor is written as prediction minus measurement and shares the
//! same frame model: the antenna at local position `p` sits at
//! `P = anchor + R · p` in ECEF, `R` being `R_ecef_local`.

use nalgebra::{Matrix3, Point3, RowSVector, RowVector3, RowVector4, Vector3, Vector4};

use super::{GnssSystem, align::LocalToEcef};

/// Unit line of sight from `receiver` to `satellite` and their distance.
#[inline]
fn line_of_sight(receiver: &Vector3<f64>, satellite: &Vector3<f64>) -> (Vector3<f64>, f64) {
    let los = satellite - receiver;
    let distance = los.norm();
    (los / distance, distance)
}

#[inline]
fn ecef(transform: &LocalToEcef, local: &Vector3<f64>) -> Vector3<f64> {
    transform.transform_point(&Point3::from(*local)).coords
}

#[inline]
fn clock_row(system: GnssSystem, weight: f64) -> RowVector4<f64> {
    let mut row = RowVector4::zeros();
    row[system.index()] = weight;
    row
}

/// Time-differenced carrier phase of one satellite between epochs `i` and `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct CarrierPhaseDiffFactor {
    pub system: GnssSystem,
    pub satellite_i: Vector3<f64>,
    pub satellite_j: Vector3<f64>,
    /// `φ_j − φ_i` in meters, already corrected for the satellite clock.
    pub phase_diff: f64,
    pub weight: f64,
}

/// Partial derivatives of a [`CarrierPhaseDiffFactor`] residual.
///
/// Frame blocks are 6 wide (position then velocity), the velocity half is
/// always zero.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDiffJacobians {
    pub anchor: RowVector3<f64>,
    pub orientation: RowVector3<f64>,
    pub frame_i: RowSVector<f64, 6>,
    pub frame_j: RowSVector<f64, 6>,
    pub clock_i: RowVector4<f64>,
    pub clock_j: RowVector4<f64>,
}

impl CarrierPhaseDiffFactor {
    pub fn residual(
        &self,
        transform: &LocalToEcef,
        position_i: &Vector3<f64>,
        position_j: &Vector3<f64>,
        clock_i: &Vector4<f64>,
        clock_j: &Vector4<f64>,
    ) -> f64 {
        let (_, range_i) = line_of_sight(&ecef(transform, position_i), &self.satellite_i);
        let (_, range_j) = line_of_sight(&ecef(transform, position_j), &self.satellite_j);
        let s = self.system.index();
        self.weight * ((range_j - range_i) + clock_j[s] - clock_i[s] - self.phase_diff)
    }

    pub fn jacobians(
        &self,
        transform: &LocalToEcef,
        position_i: &Vector3<f64>,
        position_j: &Vector3<f64>,
    ) -> PhaseDiffJacobians {
        let w = self.weight;
        let rotation = transform.rotation.matrix();
        let (unit_i, _) = line_of_sight(&ecef(transform, position_i), &self.satellite_i);
        let (unit_j, _) = line_of_sight(&ecef(transform, position_j), &self.satellite_j);

        let mut frame_i = RowSVector::<f64, 6>::zeros();
        frame_i
            .fixed_columns_mut::<3>(0)
            .copy_from(&(unit_i.transpose() * rotation * w));
        let mut frame_j = RowSVector::<f64, 6>::zeros();
        frame_j
            .fixed_columns_mut::<3>(0)
            .copy_from(&(unit_j.transpose() * rotation * -w));

        PhaseDiffJacobians {
            anchor: (unit_i - unit_j).transpose() * w,
            orientation: (unit_j.transpose() * rotation * position_j.cross_matrix()
                - unit_i.transpose() * rotation * position_i.cross_matrix())
                * w,
            frame_i,
            frame_j,
            clock_i: clock_row(self.system, -w),
            clock_j: clock_row(self.system, w),
        }
    }
}

/// Pseudorange of one satellite at one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudorangeFactor {
    pub system: GnssSystem,
    pub satellite: Vector3<f64>,
    /// `ρ + c·dt_sv − I`, so that it predicts `‖sv − P‖ + clock`.
    pub corrected_range: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PseudorangeJacobians {
    pub anchor: RowVector3<f64>,
    pub orientation: RowVector3<f64>,
    pub position: RowVector3<f64>,
    pub clock: RowVector4<f64>,
}

impl PseudorangeFactor {
    pub fn residual(
        &self,
        transform: &LocalToEcef,
        position: &Vector3<f64>,
        clock: &Vector4<f64>,
    ) -> f64 {
        let (_, range) = line_of_sight(&ecef(transform, position), &self.satellite);
        self.weight * (range + clock[self.system.index()] - self.corrected_range)
    }

    pub fn jacobians(&self, transform: &LocalToEcef, position: &Vector3<f64>) -> PseudorangeJacobians {
        let w = self.weight;
        let rotation = transform.rotation.matrix();
        let (unit, _) = line_of_sight(&ecef(transform, position), &self.satellite);
        PseudorangeJacobians {
            anchor: unit.transpose() * -w,
            orientation: unit.transpose() * rotation * position.cross_matrix() * w,
            position: unit.transpose() * rotation * -w,
            clock: clock_row(self.system, w),
        }
    }
}

/// Pseudorange rate of one satellite at epoch `j`.
///
/// The receiver clock drift is the clock change since epoch `i` over
/// `interval`, so the factor links the clocks of both frames.
#[derive(Debug, Clone, PartialEq)]
pub struct DopplerFactor {
    pub system: GnssSystem,
    pub satellite: Vector3<f64>,
    pub satellite_velocity: Vector3<f64>,
    /// Measured pseudorange rate corrected for the satellite clock drift, m/s.
    pub range_rate: f64,
    /// `t_j − t_i`.
    pub interval: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DopplerJacobians {
    pub anchor: RowVector3<f64>,
    pub orientation: RowVector3<f64>,
    /// Position then velocity of frame `j`.
    pub frame_j: RowSVector<f64, 6>,
    pub clock_i: RowVector4<f64>,
    pub clock_j: RowVector4<f64>,
}

impl DopplerFactor {
    pub fn residual(
        &self,
        transform: &LocalToEcef,
        position: &Vector3<f64>,
        velocity: &Vector3<f64>,
        clock_i: &Vector4<f64>,
        clock_j: &Vector4<f64>,
    ) -> f64 {
        let (unit, _) = line_of_sight(&ecef(transform, position), &self.satellite);
        let relative = self.satellite_velocity - transform.rotation * velocity;
        let s = self.system.index();
        let drift = (clock_j[s] - clock_i[s]) / self.interval;
        self.weight * (unit.dot(&relative) + drift - self.range_rate)
    }

    pub fn jacobians(
        &self,
        transform: &LocalToEcef,
        position: &Vector3<f64>,
        velocity: &Vector3<f64>,
    ) -> DopplerJacobians {
        let w = self.weight;
        let rotation = transform.rotation.matrix();
        let (unit, distance) = line_of_sight(&ecef(transform, position), &self.satellite);
        let relative = self.satellite_velocity - rotation * velocity;
        // ∂unit/∂receiver = -(I - u uᵀ) / d
        let projected =
            relative.transpose() * (Matrix3::identity() - unit * unit.transpose()) / distance;

        let mut frame_j = RowSVector::<f64, 6>::zeros();
        frame_j
            .fixed_columns_mut::<3>(0)
            .copy_from(&(projected * rotation * -w));
        frame_j
            .fixed_columns_mut::<3>(3)
            .copy_from(&(unit.transpose() * rotation * -w));

        DopplerJacobians {
            anchor: projected * -w,
            orientation: (projected * rotation * position.cross_matrix()
                + unit.transpose() * rotation * velocity.cross_matrix())
                * w,
            frame_j,
            clock_i: clock_row(self.system, -w / self.interval),
            clock_j: clock_row(self.system, w / self.interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::{
        align::local_to_ecef,
        geodesy::{Geodetic, geodetic_to_ecef, rotation_ecef_enu_at},
        spp::tests::sky,
    };
    use approx::assert_relative_eq;

    fn frame() -> LocalToEcef {
        let anchor = geodetic_to_ecef(&Geodetic {
            latitude: 0.39,
            longitude: 1.99,
            height: 20.0,
        });
        local_to_ecef(anchor, rotation_ecef_enu_at(&anchor), 0.3)
    }

    #[test]
    fn test_phase_diff_vanishes_on_noiseless_data() {
        let transform = frame();
        let position_i = Vector3::new(1.0, 2.0, 0.1);
        let position_j = Vector3::new(1.8, 2.5, 0.1);
        let mut clock_i = Vector4::zeros();
        let mut clock_j = Vector4::zeros();
        clock_i[GnssSystem::Galileo.index()] = 12.0;
        clock_j[GnssSystem::Galileo.index()] = 12.4;

        for satellite in sky(&transform.translation.vector) {
            let drift = Vector3::new(30.0, -50.0, 10.0);
            let satellite_j = satellite + drift;
            let range = |sv: &Vector3<f64>, local: &Vector3<f64>| (sv - ecef(&transform, local)).norm();
            // a constant ambiguity cancels in the difference
            let ambiguity = 1234.5;
            let phase_i = range(&satellite, &position_i) + 12.0 + ambiguity;
            let phase_j = range(&satellite_j, &position_j) + 12.4 + ambiguity;

            let factor = CarrierPhaseDiffFactor {
                system: GnssSystem::Galileo,
                satellite_i: satellite,
                satellite_j,
                phase_diff: phase_j - phase_i,
                weight: 20.0,
            };
            let residual = factor.residual(&transform, &position_i, &position_j, &clock_i, &clock_j);
            assert!(residual.abs() < 1e-5, "residual {residual}");
        }
    }

    #[test]
    fn test_phase_diff_jacobians_match_finite_differences() {
        let transform = frame();
        let position_i = Vector3::new(1.0, 2.0, 0.1);
        let position_j = Vector3::new(5.0, -3.0, 0.4);
        let zero = Vector4::zeros();
        let satellite = sky(&transform.translation.vector)[2];
        let factor = CarrierPhaseDiffFactor {
            system: GnssSystem::Gps,
            satellite_i: satellite,
            satellite_j: satellite + Vector3::new(100.0, 0.0, 0.0),
            phase_diff: 3.0,
            weight: 2.0,
        };
        let jacobians = factor.jacobians(&transform, &position_i, &position_j);
        let eps = 1e-3;

        for axis in 0..3 {
            let mut step = Vector3::zeros();
            step[axis] = eps;

            let forward = factor.residual(&transform, &position_i, &(position_j + step), &zero, &zero);
            let backward = factor.residual(&transform, &position_i, &(position_j - step), &zero, &zero);
            assert_relative_eq!((forward - backward) / (2.0 * eps), jacobians.frame_j[axis], epsilon = 1e-4);

            let forward = factor.residual(&transform, &(position_i + step), &position_j, &zero, &zero);
            let backward = factor.residual(&transform, &(position_i - step), &position_j, &zero, &zero);
            assert_relative_eq!((forward - backward) / (2.0 * eps), jacobians.frame_i[axis], epsilon = 1e-4);

            let mut moved = transform.clone();
            moved.translation.vector += step;
            let forward = factor.residual(&moved, &position_i, &position_j, &zero, &zero);
            assert_relative_eq!(
                (forward - factor.residual(&transform, &position_i, &position_j, &zero, &zero)) / eps,
                jacobians.anchor[axis],
                epsilon = 1e-4
            );
        }
        assert_eq!(jacobians.frame_i.fixed_columns::<3>(3).amax(), 0.0);
        assert_eq!(jacobians.clock_j[GnssSystem::Gps.index()], 2.0);
        assert_eq!(jacobians.clock_i[GnssSystem::Gps.index()], -2.0);
    }

    #[test]
    fn test_pseudorange_orientation_jacobian() {
        let transform = frame();
        let position = Vector3::new(4.0, -1.0, 2.0);
        let satellite = sky(&transform.translation.vector)[4];
        let factor = PseudorangeFactor {
            system: GnssSystem::Gps,
            satellite,
            corrected_range: 2.0e7,
            weight: 1.0,
        };
        let jacobians = factor.jacobians(&transform, &position);
        let eps = 1e-4;
        let rotated = |delta: Vector3<f64>| {
            let mut moved = transform.clone();
            moved.rotation *= nalgebra::Rotation3::new(delta);
            factor.residual(&moved, &position, &Vector4::zeros())
        };
        for axis in 0..3 {
            let mut delta = Vector3::zeros();
            delta[axis] = eps;
            let numeric = (rotated(delta) - rotated(-delta)) / (2.0 * eps);
            assert_relative_eq!(numeric, jacobians.orientation[axis], epsilon = 1e-3);
        }
    }

    fn doppler(transform: &LocalToEcef, position: &Vector3<f64>, velocity: &Vector3<f64>) -> DopplerFactor {
        let satellite = sky(&transform.translation.vector)[1];
        let satellite_velocity = Vector3::new(1200.0, -3100.0, 450.0);
        let receiver = ecef(transform, position);
        let unit = (satellite - receiver).normalize();
        DopplerFactor {
            system: GnssSystem::BeiDou,
            satellite,
            satellite_velocity,
            // 0.6 m of clock change over half a second
            range_rate: unit.dot(&(satellite_velocity - transform.rotation * velocity)) + 1.2,
            interval: 0.5,
            weight: 4.0,
        }
    }

    #[test]
    fn test_doppler_vanishes_on_noiseless_data() {
        let transform = frame();
        let position = Vector3::new(3.0, -2.0, 0.5);
        let velocity = Vector3::new(1.5, 0.5, 0.0);
        let factor = doppler(&transform, &position, &velocity);
        let clock_i = Vector4::new(0.0, 0.0, 0.0, 40.0);
        let clock_j = Vector4::new(0.0, 0.0, 0.0, 40.6);
        let residual = factor.residual(&transform, &position, &velocity, &clock_i, &clock_j);
        assert!(residual.abs() < 1e-6, "residual {residual}");

        let jacobians = factor.jacobians(&transform, &position, &velocity);
        let index = GnssSystem::BeiDou.index();
        assert_relative_eq!(jacobians.clock_j[index], 8.0);
        assert_relative_eq!(jacobians.clock_i[index], -8.0);
    }

    #[test]
    fn test_doppler_jacobians_match_finite_differences() {
        let transform = frame();
        let position = Vector3::new(3.0, -2.0, 0.5);
        let velocity = Vector3::new(1.5, 0.5, 0.0);
        let factor = doppler(&transform, &position, &velocity);
        let jacobians = factor.jacobians(&transform, &position, &velocity);
        let zero = Vector4::zeros();
        let residual = |transform: &LocalToEcef, position: &Vector3<f64>, velocity: &Vector3<f64>| {
            factor.residual(transform, position, velocity, &zero, &zero)
        };

        for axis in 0..3 {
            let mut step = Vector3::zeros();
            step[axis] = 1e-3;
            let numeric = (residual(&transform, &(position + step), &velocity)
                - residual(&transform, &(position - step), &velocity))
                / 2e-3;
            assert_relative_eq!(numeric, jacobians.frame_j[axis], epsilon = 1e-8);

            let numeric = (residual(&transform, &position, &(velocity + step))
                - residual(&transform, &position, &(velocity - step)))
                / 2e-3;
            assert_relative_eq!(numeric, jacobians.frame_j[3 + axis], epsilon = 1e-8);

            let mut ahead = transform.clone();
            ahead.rotation *= nalgebra::Rotation3::new(step * 0.1);
            let mut behind = transform.clone();
            behind.rotation *= nalgebra::Rotation3::new(step * -0.1);
            let numeric = (residual(&ahead, &position, &velocity)
                - residual(&behind, &position, &velocity))
                / 2e-4;
            assert_relative_eq!(numeric, jacobians.orientation[axis], epsilon = 1e-4);
        }
    }
}
