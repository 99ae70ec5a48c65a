mod init;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::eskf::observe::{JacobianBlock, Measurement};

use super::super::state::{
    State,
    marker::{AccelBias, AngularRate, GyroBias, SpecificForce},
};

pub use init::ImuInit;

#[derive(Debug, Clone, PartialEq)]
pub struct ImuSample {
    pub timestamp: f64,
    pub angular_velocity: Vector3<f64>,
    pub linear_acceleration: Vector3<f64>,
}

impl ImuSample {
    pub const fn new(
        timestamp: f64,
        angular_velocity: Vector3<f64>,
        linear_acceleration: Vector3<f64>,
    ) -> Self {
        Self {
            timestamp,
            angular_velocity,
            linear_acceleration,
        }
    }
}

/// IMU readings as an observation of the output-model rates:
/// `z = [ω_m; a_m·scale]`, `h = [ω + b_g; a + b_a]`.
///
/// Axes whose raw reading reached the saturation limit carry no information
/// and get zero rows.
#[derive(Debug, Clone)]
pub struct ImuMeasurement {
    pub gyro: Vector3<f64>,
    /// Accelerometer reading already scaled to the gravity norm.
    pub acc: Vector3<f64>,
    pub saturated_gyro: [bool; 3],
    pub saturated_acc: [bool; 3],
    pub gyro_noise: f64,
    pub acc_noise: f64,
}

impl ImuMeasurement {
    /// `acc_scale` maps the raw accelerometer unit onto m/s².
    pub fn new(
        sample: &ImuSample,
        acc_scale: f64,
        gyro_limit: f64,
        acc_limit: f64,
        gyro_noise: f64,
        acc_noise: f64,
    ) -> Self {
        Self {
            gyro: sample.angular_velocity,
            acc: sample.linear_acceleration * acc_scale,
            saturated_gyro: sample.angular_velocity.map(|x| x.abs() >= gyro_limit).into(),
            saturated_acc: sample
                .linear_acceleration
                .map(|x| x.abs() >= acc_limit)
                .into(),
            gyro_noise,
            acc_noise,
        }
    }

    fn saturated(&self, row: usize) -> bool {
        if row < 3 {
            self.saturated_gyro[row]
        } else {
            self.saturated_acc[row - 3]
        }
    }

    /// A 6×3 block with identity on rows `first..first + 3`, saturated rows cleared.
    fn identity_block(&self, first: usize) -> DMatrix<f64> {
        let mut block = DMatrix::zeros(6, 3);
        for i in 0..3 {
            if !self.saturated(first + i) {
                block[(first + i, i)] = 1.0;
            }
        }
        block
    }
}

impl Measurement<State> for ImuMeasurement {
    fn residual(&self, state: &State) -> DVector<f64> {
        let gyro = self.gyro - state.omg - state.bg;
        let acc = self.acc - state.acc - state.ba;
        DVector::from_fn(6, |row, _| match row {
            _ if self.saturated(row) => 0.0,
            0..3 => gyro[row],
            _ => acc[row - 3],
        })
    }

    fn jacobian_blocks(&self, _state: &State) -> Vec<JacobianBlock<f64>> {
        let gyro = self.identity_block(0);
        let acc = self.identity_block(3);
        vec![
            JacobianBlock::of::<AngularRate, State>(gyro.clone()),
            JacobianBlock::of::<GyroBias, State>(gyro),
            JacobianBlock::of::<SpecificForce, State>(acc.clone()),
            JacobianBlock::of::<AccelBias, State>(acc),
        ]
    }

    fn noise(&self) -> DVector<f64> {
        DVector::from_fn(6, |row, _| {
            if row < 3 {
                self.gyro_noise
            } else {
                self.acc_noise
            }
        })
    }
}
