//! Filter-side GNSS and NMEA rows.
//!
//! The factors in [`crate::gnss`] are written as prediction minus measurement
//! against a local antenna position. Here they are turned into `z - h` rows on
//! the filter's rotation and position blocks through the antenna lever arm.
//! Receiver clocks are not filter states: every group removes its per-system
//! mean, which eliminates the common clock term.

use nalgebra::{DMatrix, DVector, Matrix3, RowVector3, Vector3, Vector4};

use crate::{
    eskf::observe::{JacobianBlock, Measurement, dynamic},
    gnss::{CarrierPhaseDiffFactor, LocalToEcef, PseudorangeFactor},
};

use super::super::state::{
    State,
    marker::{Position, Rotation, Velocity},
};

/// Local position of the antenna mounted at `lever_arm` in the IMU frame.
#[inline]
pub fn antenna_position(state: &State, lever_arm: &Vector3<f64>) -> Vector3<f64> {
    state.pos + state.rot * lever_arm
}

/// `∂antenna/∂δθ` for a right-perturbed rotation.
#[inline]
fn antenna_rotation_jacobian(state: &State, lever_arm: &Vector3<f64>) -> Matrix3<f64> {
    -(state.rot.matrix() * lever_arm.cross_matrix())
}

/// Subtracts the mean row from every row.
fn center_rows(rows: &mut DMatrix<f64>) {
    if rows.nrows() == 0 {
        return;
    }
    let mean = rows.row_mean();
    for mut row in rows.row_iter_mut() {
        row -= &mean;
    }
}

/// Centered `z - h` from the raw `h - z` values.
fn centered_residual(errors: impl Iterator<Item = f64>) -> DVector<f64> {
    let mut residual = DVector::from_vec(errors.collect());
    if !residual.is_empty() {
        let mean = residual.mean();
        residual.add_scalar_mut(-mean);
    }
    -residual
}

/// Antenna-position rows mapped onto the rotation and position blocks.
fn lever_arm_blocks(
    state: &State,
    lever_arm: &Vector3<f64>,
    antenna_rows: DMatrix<f64>,
) -> Vec<JacobianBlock<f64>> {
    let rotation = dynamic(&(&antenna_rows * antenna_rotation_jacobian(state, lever_arm)));
    vec![
        JacobianBlock::of::<Rotation, State>(rotation),
        JacobianBlock::of::<Position, State>(antenna_rows),
    ]
}

fn stack_rows(rows: impl ExactSizeIterator<Item = RowVector3<f64>>) -> DMatrix<f64> {
    let count = rows.len();
    let mut stacked = DMatrix::zeros(count, 3);
    for (i, row) in rows.enumerate() {
        stacked.row_mut(i).copy_from(&row);
    }
    stacked
}

/// Pseudoranges of one constellation at one epoch.
#[derive(Debug, Clone)]
pub struct PseudorangeGroup {
    pub transform: LocalToEcef,
    pub lever_arm: Vector3<f64>,
    pub factors: Vec<PseudorangeFactor>,
    pub variance: f64,
}

impl Measurement<State> for PseudorangeGroup {
    fn residual(&self, state: &State) -> DVector<f64> {
        let antenna = antenna_position(state, &self.lever_arm);
        let clock = Vector4::zeros();
        centered_residual(
            self.factors
                .iter()
                .map(|factor| factor.residual(&self.transform, &antenna, &clock)),
        )
    }

    fn jacobian_blocks(&self, state: &State) -> Vec<JacobianBlock<f64>> {
        let antenna = antenna_position(state, &self.lever_arm);
        let mut rows = stack_rows(
            self.factors
                .iter()
                .map(|factor| factor.jacobians(&self.transform, &antenna).position),
        );
        center_rows(&mut rows);
        lever_arm_blocks(state, &self.lever_arm, rows)
    }

    fn noise(&self) -> DVector<f64> {
        DVector::from_element(self.factors.len(), self.variance)
    }
}

/// Time-differenced carrier phases of one constellation between the previous
/// epoch, held fixed at its posterior antenna position, and the current one.
#[derive(Debug, Clone)]
pub struct PhaseDiffGroup {
    pub transform: LocalToEcef,
    pub lever_arm: Vector3<f64>,
    pub previous_antenna: Vector3<f64>,
    pub factors: Vec<CarrierPhaseDiffFactor>,
    pub variance: f64,
}

impl Measurement<State> for PhaseDiffGroup {
    fn residual(&self, state: &State) -> DVector<f64> {
        let antenna = antenna_position(state, &self.lever_arm);
        let clock = Vector4::zeros();
        centered_residual(self.factors.iter().map(|factor| {
            factor.residual(
                &self.transform,
                &self.previous_antenna,
                &antenna,
                &clock,
                &clock,
            )
        }))
    }

    fn jacobian_blocks(&self, state: &State) -> Vec<JacobianBlock<f64>> {
        let antenna = antenna_position(state, &self.lever_arm);
        let mut rows = stack_rows(self.factors.iter().map(|factor| {
            factor
                .jacobians(&self.transform, &self.previous_antenna, &antenna)
                .frame_j
                .fixed_columns::<3>(0)
                .into_owned()
        }));
        center_rows(&mut rows);
        lever_arm_blocks(state, &self.lever_arm, rows)
    }

    fn noise(&self) -> DVector<f64> {
        DVector::from_element(self.factors.len(), self.variance)
    }
}

/// A receiver fix already expressed in the local frame.
#[derive(Debug, Clone)]
pub struct NmeaMeasurement {
    pub position: Vector3<f64>,
    pub velocity: Option<Vector3<f64>>,
    pub lever_arm: Vector3<f64>,
    pub position_variance: Vector3<f64>,
    pub velocity_variance: f64,
}

impl NmeaMeasurement {
    #[inline]
    fn rows(&self) -> usize {
        if self.velocity.is_some() { 6 } else { 3 }
    }
}

impl Measurement<State> for NmeaMeasurement {
    fn residual(&self, state: &State) -> DVector<f64> {
        let mut residual = DVector::zeros(self.rows());
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&(self.position - antenna_position(state, &self.lever_arm)));
        if let Some(velocity) = &self.velocity {
            residual
                .fixed_rows_mut::<3>(3)
                .copy_from(&(velocity - state.vel));
        }
        residual
    }

    fn jacobian_blocks(&self, state: &State) -> Vec<JacobianBlock<f64>> {
        let rows = self.rows();
        let mut position = DMatrix::zeros(rows, 3);
        position
            .fixed_view_mut::<3, 3>(0, 0)
            .fill_with_identity();
        let mut rotation = DMatrix::zeros(rows, 3);
        rotation
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&antenna_rotation_jacobian(state, &self.lever_arm));

        let mut blocks = vec![
            JacobianBlock::of::<Rotation, State>(rotation),
            JacobianBlock::of::<Position, State>(position),
        ];
        if self.velocity.is_some() {
            let mut velocity = DMatrix::zeros(rows, 3);
            velocity
                .fixed_view_mut::<3, 3>(3, 0)
                .fill_with_identity();
            blocks.push(JacobianBlock::of::<Velocity, State>(velocity));
        }
        blocks
    }

    fn noise(&self) -> DVector<f64> {
        let mut noise = DVector::from_element(self.rows(), self.velocity_variance);
        noise.fixed_rows_mut::<3>(0).copy_from(&self.position_variance);
        noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithm::ligo::state::ErrorState,
        eskf::state::Manifold,
        gnss::{
            GnssSystem,
            geodesy::{Geodetic, geodetic_to_ecef, rotation_ecef_enu_at},
            local_to_ecef,
        },
    };
    use nalgebra::{Point3, Rotation3};

    fn lever_state() -> State {
        State {
            rot: Rotation3::new(Vector3::new(0.1, -0.3, 0.8)),
            pos: Vector3::new(3.0, -2.0, 1.0),
            ..Default::default()
        }
    }

    /// Central-difference `∂h/∂δx` from the residual, `h = z - r`.
    fn numeric_jacobian(measurement: &impl Measurement<State>, state: &State) -> DMatrix<f64> {
        let rows = measurement.residual(state).len();
        let eps = 1e-3;
        let mut jacobian = DMatrix::zeros(rows, 24);
        for column in 0..24 {
            let mut delta = ErrorState::zeros();
            delta[column] = eps;
            let mut forward = state.clone();
            forward.boxplus(&delta);
            let mut backward = state.clone();
            backward.boxplus(&-delta);
            let diff =
                (measurement.residual(&backward) - measurement.residual(&forward)) / (2.0 * eps);
            jacobian.column_mut(column).copy_from(&diff);
        }
        jacobian
    }

    fn analytic_jacobian(measurement: &impl Measurement<State>, state: &State) -> DMatrix<f64> {
        let rows = measurement.residual(state).len();
        let mut jacobian = DMatrix::zeros(rows, 24);
        for block in measurement.jacobian_blocks(state) {
            jacobian
                .view_mut((0, block.offset), block.value.shape())
                .copy_from(&block.value);
        }
        jacobian
    }

    #[test]
    fn test_nmea_rows_match_numerical_jacobian() {
        let state = lever_state();
        let measurement = NmeaMeasurement {
            position: Vector3::new(3.5, -1.0, 1.2),
            velocity: Some(Vector3::new(1.0, 0.0, 0.0)),
            lever_arm: Vector3::new(0.3, 0.1, 0.6),
            position_variance: Vector3::repeat(0.01),
            velocity_variance: 0.04,
        };
        let analytic = analytic_jacobian(&measurement, &state);
        let numeric = numeric_jacobian(&measurement, &state);
        assert!((analytic - numeric).amax() < 1e-5);
        assert_eq!(measurement.noise().len(), 6);
    }

    #[test]
    fn test_pseudorange_group_is_clock_free() {
        let anchor = geodetic_to_ecef(&Geodetic {
            latitude: 0.7,
            longitude: -1.2,
            height: 50.0,
        });
        let transform = local_to_ecef(anchor, rotation_ecef_enu_at(&anchor), 0.3);
        let state = lever_state();
        let lever_arm = Vector3::new(0.2, 0.0, 0.5);
        let receiver = transform
            .transform_point(&Point3::from(antenna_position(&state, &lever_arm)))
            .coords;

        // noiseless ranges plus a common receiver clock of 120 m
        let factors = crate::gnss::spp::tests::sky(&anchor)
            .into_iter()
            .map(|satellite| PseudorangeFactor {
                system: GnssSystem::Galileo,
                satellite,
                corrected_range: (satellite - receiver).norm() + 120.0,
                weight: 1.0,
            })
            .collect();
        let group = PseudorangeGroup {
            transform,
            lever_arm,
            factors,
            variance: 25.0,
        };

        assert!(group.residual(&state).amax() < 1e-6);
        let analytic = analytic_jacobian(&group, &state);
        let numeric = numeric_jacobian(&group, &state);
        assert!((analytic - numeric).amax() < 1e-4);
    }
}
