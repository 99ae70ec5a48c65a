//! IMU pre-integration between GNSS frames, used when there is no LiDAR to
//! hold the trajectory together.

use nalgebra::{Matrix3, Rotation3, SMatrix, Vector3};
use serde::Deserialize;

pub type PreintegrationCov = SMatrix<f64, 9, 9>;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PreintegrationNoise {
    pub acc: f64,
    pub gyr: f64,
}

impl Default for PreintegrationNoise {
    fn default() -> Self {
        Self { acc: 0.1, gyr: 0.01 }
    }
}

/// Rotation, position and velocity of one back-end frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEstimate {
    pub rotation: Rotation3<f64>,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

/// Midpoint pre-integration of `ΔR`, `Δv` and `Δp`.
///
/// The covariance is ordered `(δθ, δv, δp)`.
#[derive(Debug, Clone)]
pub struct ImuPreintegration {
    acc0: Vector3<f64>,
    gyr0: Vector3<f64>,
    /// `(acc0, gyr0)` at the start of the interval, replayed by [`Self::repropagate`].
    start_reference: (Vector3<f64>, Vector3<f64>),
    linearized_ba: Vector3<f64>,
    linearized_bg: Vector3<f64>,

    pub sum_dt: f64,
    pub delta_p: Vector3<f64>,
    pub delta_v: Vector3<f64>,
    pub delta_r: Rotation3<f64>,
    pub covariance: PreintegrationCov,

    noise: PreintegrationNoise,
    buffer: Vec<(f64, Vector3<f64>, Vector3<f64>)>,
}

impl ImuPreintegration {
    pub fn new(
        acc0: Vector3<f64>,
        gyr0: Vector3<f64>,
        ba: Vector3<f64>,
        bg: Vector3<f64>,
        noise: PreintegrationNoise,
    ) -> Self {
        Self {
            acc0,
            gyr0,
            start_reference: (acc0, gyr0),
            linearized_ba: ba,
            linearized_bg: bg,
            sum_dt: 0.0,
            delta_p: Vector3::zeros(),
            delta_v: Vector3::zeros(),
            delta_r: Rotation3::identity(),
            covariance: PreintegrationCov::zeros(),
            noise,
            buffer: Vec::new(),
        }
    }

    /// Integrates one sample `dt` after the previous one. Non-positive
    /// intervals are ignored.
    pub fn push_back(&mut self, dt: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        if dt <= 0.0 {
            return;
        }
        self.buffer.push((dt, acc, gyr));
        self.propagate(dt, acc, gyr);
    }

    /// Restarts the midpoint from a new reference sample. On an empty
    /// interval it also becomes the sample [`Self::repropagate`] starts from.
    pub fn set_acc0_gyr0(&mut self, acc: Vector3<f64>, gyr: Vector3<f64>) {
        self.acc0 = acc;
        self.gyr0 = gyr;
        if self.buffer.is_empty() {
            self.start_reference = (acc, gyr);
        }
    }

    /// Integrates the buffered samples again under new bias estimates.
    pub fn repropagate(&mut self, ba: Vector3<f64>, bg: Vector3<f64>) {
        let (acc0, gyr0) = self.start_reference;
        let buffer = std::mem::take(&mut self.buffer);

        self.linearized_ba = ba;
        self.linearized_bg = bg;
        self.clear_deltas();
        self.acc0 = acc0;
        self.gyr0 = gyr0;

        for &(dt, acc, gyr) in &buffer {
            self.propagate(dt, acc, gyr);
        }
        self.buffer = buffer;
    }

    /// Starts a new interval at the latest sample, keeping the biases.
    pub fn reset(&mut self) {
        self.clear_deltas();
        self.buffer.clear();
        self.start_reference = (self.acc0, self.gyr0);
    }

    /// Frame `j` predicted from frame `i` and gravity in the frame's world.
    pub fn predict(&self, previous: &FrameEstimate, gravity: &Vector3<f64>) -> FrameEstimate {
        let dt = self.sum_dt;
        FrameEstimate {
            rotation: previous.rotation * self.delta_r,
            position: previous.position
                + previous.velocity * dt
                + gravity * (0.5 * dt * dt)
                + previous.rotation * self.delta_p,
            velocity: previous.velocity + gravity * dt + previous.rotation * self.delta_v,
        }
    }

    fn clear_deltas(&mut self) {
        self.sum_dt = 0.0;
        self.delta_p = Vector3::zeros();
        self.delta_v = Vector3::zeros();
        self.delta_r = Rotation3::identity();
        self.covariance = PreintegrationCov::zeros();
    }

    fn propagate(&mut self, dt: f64, acc1: Vector3<f64>, gyr1: Vector3<f64>) {
        let un_acc_0 = self.delta_r * (self.acc0 - self.linearized_ba);
        let un_gyr = (self.gyr0 + gyr1) * 0.5 - self.linearized_bg;
        let step = Rotation3::new(un_gyr * dt);
        let delta_r = self.delta_r * step;
        let un_acc_1 = delta_r * (acc1 - self.linearized_ba);
        let un_acc = (un_acc_0 + un_acc_1) * 0.5;

        // F = ∂(δθ, δv, δp)_{k+1} / ∂(δθ, δv, δp)_k
        let mid_acc_body = ((self.acc0 + acc1) * 0.5 - self.linearized_ba).cross_matrix();
        let rotation_acc = self.delta_r.matrix() * mid_acc_body;
        let mut transition = PreintegrationCov::identity();
        transition
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(step.inverse().matrix());
        transition
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-rotation_acc * dt));
        transition
            .fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-rotation_acc * (0.5 * dt * dt)));
        transition
            .fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));

        let mut noise = PreintegrationCov::zeros();
        let gyr_var = (self.noise.gyr * dt).powi(2);
        let acc_var = (self.noise.acc * dt).powi(2);
        noise.fixed_view_mut::<3, 3>(0, 0).fill_diagonal(gyr_var);
        noise.fixed_view_mut::<3, 3>(3, 3).fill_diagonal(acc_var);
        noise
            .fixed_view_mut::<3, 3>(6, 6)
            .fill_diagonal(0.25 * acc_var * dt * dt);

        self.covariance = transition * self.covariance * transition.transpose() + noise;

        self.delta_p += self.delta_v * dt + un_acc * (0.5 * dt * dt);
        self.delta_v += un_acc * dt;
        self.delta_r = delta_r;
        self.delta_r.renormalize();
        self.sum_dt += dt;
        self.acc0 = acc1;
        self.gyr0 = gyr1;
    }
}
