use nalgebra::{Matrix3, Rotation3, SMatrix, Vector3};
use serde::Deserialize;

use crate::eskf::{Covariance, DeltaTime, Eskf, KFTime, Propagate, StatePredictor};

use super::state::{State, marker::*};

/// What drives a propagation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropagationInput {
    /// The state's own angular rate and specific force.
    Output,
    /// An IMU reading, biases not yet removed.
    Imu {
        gyro: Vector3<f64>,
        acc: Vector3<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub dt: DeltaTime<f64>,
    pub input: PropagationInput,
}

impl Prediction {
    /// Leaves the filter where it is.
    pub const fn none() -> Self {
        Self {
            dt: KFTime { mean: 0.0, cov: 0.0 },
            input: PropagationInput::Output,
        }
    }
}

impl PropagationInput {
    /// Bias-free angular rate and specific force.
    #[inline]
    fn rates(&self, state: &State) -> (Vector3<f64>, Vector3<f64>) {
        match self {
            Self::Output => (state.omg, state.acc),
            Self::Imu { gyro, acc } => (gyro - state.bg, acc - state.ba),
        }
    }
}

impl State {
    /// Moves the mean forward by `dt`.
    pub fn predict(&mut self, dt: f64, input: &PropagationInput) {
        if dt <= 0.0 {
            return;
        }
        let (omg, acc) = input.rates(self);
        if let PropagationInput::Imu { .. } = input {
            self.omg = omg;
            self.acc = acc;
        }

        let delta_velocity = (self.rot * acc + self.gravity) * dt;
        self.pos += self.vel * dt;
        self.vel += delta_velocity;
        self.rot *= Rotation3::new(omg * dt);
        self.rot.renormalize();
        self.clock.predict(dt);
    }
}

impl Eskf<State> {
    /// `P = F P Fᵀ + dt² Q`, linearized at the current mean.
    pub fn predict_cov(&mut self, dt: f64, input: &PropagationInput) {
        if dt <= 0.0 {
            return;
        }
        let state = &self.state;
        let (omg, acc) = input.rates(state);
        let rot = state.rot.matrix();

        let mut fx = Covariance::<State>(SMatrix::identity());

        fx.sub_covariance_mut::<Rotation>()
            .copy_from(Rotation3::new(omg * -dt).matrix());

        fx.sensitivity_mut::<Velocity, Position>()
            .fill_diagonal(dt);

        fx.sensitivity_mut::<Rotation, Velocity>()
            .copy_from(&(rot * acc.cross_matrix() * -dt));

        fx.sensitivity_mut::<Gravity, Velocity>()
            .fill_diagonal(dt);

        match input {
            PropagationInput::Output => {
                fx.sensitivity_mut::<AngularRate, Rotation>()
                    .fill_diagonal(dt);
                fx.sensitivity_mut::<SpecificForce, Velocity>()
                    .copy_from(&(rot * dt));
            }
            PropagationInput::Imu { .. } => {
                fx.sensitivity_mut::<GyroBias, Rotation>()
                    .fill_diagonal(-dt);
                fx.sensitivity_mut::<AccelBias, Velocity>()
                    .copy_from(&(rot * -dt));
            }
        }

        let mut cov = *self.process_cov * dt.powi(2);
        cov.quadform_tr(1.0, &fx.0, &self.cov.0, 1.0);
        *self.cov = cov;
        self.cov.symmetrize();
    }

    /// Advances the clocks named by `target` to `timestamp` and propagates
    /// over the elapsed intervals.
    pub fn propagate_to(
        &mut self,
        timestamp: f64,
        input: &PropagationInput,
        target: Propagate,
    ) -> DeltaTime<f64> {
        let dt = self.advance_clocks(timestamp, target);
        self.predict(Prediction { dt, input: *input });
        dt
    }
}

impl StatePredictor<Prediction> for Eskf<State> {
    fn predict(&mut self, Prediction { dt, input }: Prediction) {
        // the covariance is linearized before the mean moves
        self.predict_cov(dt.cov, &input);
        self.state.predict(dt.mean, &input);
    }
}

/// Diagonal process noise, per second squared of propagation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessNoiseConfig {
    pub velocity: f64,
    pub angular_rate: f64,
    pub specific_force: f64,
    pub gyro_bias: f64,
    pub accel_bias: f64,
    /// Gyroscope noise when the IMU drives propagation.
    pub gyro_input: f64,
    /// Accelerometer noise when the IMU drives propagation.
    pub acc_input: f64,
}

impl Default for ProcessNoiseConfig {
    fn default() -> Self {
        Self {
            velocity: 20.0,
            angular_rate: 1000.0,
            specific_force: 500.0,
            gyro_bias: 1e-4,
            accel_bias: 1e-4,
            gyro_input: 0.1,
            acc_input: 0.1,
        }
    }
}

impl ProcessNoiseConfig {
    pub fn covariance(&self, imu_as_input: bool) -> Covariance<State> {
        let mut cov = Covariance::<State>::default();
        if imu_as_input {
            cov.sub_covariance_mut::<Rotation>()
                .copy_from(&(Matrix3::identity() * self.gyro_input));
            cov.sub_covariance_mut::<Velocity>()
                .copy_from(&(Matrix3::identity() * self.acc_input));
        } else {
            cov.sub_covariance_mut::<Velocity>()
                .fill_diagonal(self.velocity);
            cov.sub_covariance_mut::<AngularRate>()
                .fill_diagonal(self.angular_rate);
            cov.sub_covariance_mut::<SpecificForce>()
                .fill_diagonal(self.specific_force);
        }
        cov.sub_covariance_mut::<GyroBias>()
            .fill_diagonal(self.gyro_bias);
        cov.sub_covariance_mut::<AccelBias>()
            .fill_diagonal(self.accel_bias);
        cov
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eskf::state::Manifold;
    use approx::assert_relative_eq;

    fn filter(imu_as_input: bool) -> Eskf<State> {
        Eskf::new_with_state(
            State::default(),
            1e-4,
            ProcessNoiseConfig::default().covariance(imu_as_input),
            0.0,
        )
    }

    #[test]
    fn test_constant_velocity_at_rest_attitude() {
        let mut eskf = filter(false);
        eskf.state.vel = Vector3::new(1.0, 0.5, 0.0);
        for step in 1..=100 {
            eskf.propagate_to(step as f64 * 0.01, &PropagationInput::Output, Propagate::Both);
        }
        // gravity is cancelled by the specific force of a resting IMU
        assert_relative_eq!(eskf.state.pos, Vector3::new(1.0, 0.5, 0.0), epsilon = 1e-9);
        assert_relative_eq!(eskf.state.vel, Vector3::new(1.0, 0.5, 0.0), epsilon = 1e-9);
        assert!(eskf.cov.asymmetry() < 1e-12);
        assert!(eskf.cov[(3, 3)] > 1e-4);
    }

    #[test]
    fn test_non_positive_interval_is_noop() {
        let mut eskf = filter(false);
        eskf.state.vel = Vector3::new(1.0, 0.0, 0.0);
        let before = eskf.state.clone();
        let cov = eskf.cov.clone();

        eskf.predict(Prediction::none());
        eskf.predict(Prediction {
            dt: KFTime::all(-0.1),
            input: PropagationInput::Output,
        });

        assert_eq!(eskf.state.boxminus(&before).amax(), 0.0);
        assert_eq!(eskf.cov.0, cov.0);
    }

    #[test]
    fn test_imu_input_removes_biases() {
        let mut eskf = filter(true);
        eskf.state.bg = Vector3::new(0.0, 0.0, 0.1);
        eskf.state.ba = Vector3::new(0.2, 0.0, 0.0);
        let input = PropagationInput::Imu {
            gyro: Vector3::new(0.0, 0.0, 0.1),
            acc: Vector3::new(0.2, 0.0, 9.81),
        };
        eskf.propagate_to(1.0, &input, Propagate::Both);

        assert_relative_eq!(eskf.state.rot.angle(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(eskf.state.vel, Vector3::zeros(), epsilon = 1e-12);
        // only the rotation couples to the gyro bias in this model
        assert!(eskf.cov[(2, 20)].abs() > 0.0);
        assert_eq!(eskf.cov[(2, 11)], 0.0);
    }

    #[test]
    fn test_mean_only_then_covariance_only() {
        let mut eskf = filter(false);
        let dt = eskf.propagate_to(0.5, &PropagationInput::Output, Propagate::Mean);
        assert_eq!(dt, KFTime { mean: 0.5, cov: 0.0 });
        assert_eq!(eskf.cov[(6, 6)], 1e-4);

        let dt = eskf.propagate_to(0.5, &PropagationInput::Output, Propagate::Covariance);
        assert_eq!(dt, KFTime { mean: 0.0, cov: 0.5 });
        assert!(eskf.cov[(6, 6)] > 1e-4);
    }
}
