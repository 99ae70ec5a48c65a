use nalgebra::{IsometryMatrix3, Rotation3, SVector, Translation3, U24, Vector3, Vector4};

use crate::{
    eskf::state::{KFState, Manifold, SubStateOf},
    gnss::GnssSystem,
};

/// The filter state.
///
/// Error-state layout (each block 3 wide):
/// ```text
/// ├ rot ┼ pos ┼ vel ┼ ω ┼ a ┼ g ┼ b_g ┼ b_a ┤
/// 0     3     6     9   12  15  18    21    24
/// ```
///
/// `rot`/`pos` map the IMU frame into the world (local map) frame. `omg` and
/// `acc` are the angular rate and specific force the IMU should be reading
/// after its biases are removed.
#[derive(Debug, Clone)]
pub struct State {
    pub rot: Rotation3<f64>,
    pub pos: Vector3<f64>,
    pub vel: Vector3<f64>,
    pub omg: Vector3<f64>,
    pub acc: Vector3<f64>,
    pub gravity: Vector3<f64>,
    pub bg: Vector3<f64>,
    pub ba: Vector3<f64>,

    /// Receiver clock offsets, kept next to (not inside) the error state.
    pub clock: ClockState,
}

pub mod marker {
    use super::State;

    crate::sub_states! {
        State {
            Rotation: U3,
            Position: U3,
            Velocity: U3,
            AngularRate: U3,
            SpecificForce: U3,
            Gravity: U3,
            GyroBias: U3,
            AccelBias: U3,
        }
    }
}

use marker::*;

pub type ErrorState = SVector<f64, 24>;

impl KFState for State {
    type Element = f64;
    type Dim = U24;
}

/// Per-constellation receiver clock offsets in meters, indexed by
/// [`GnssSystem::index`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClockState {
    pub current: Vector4<f64>,
    pub previous: Vector4<f64>,
    pub variance: Vector4<f64>,
    /// Variance growth per second, m²/s.
    pub process_noise: f64,
}

impl Default for ClockState {
    fn default() -> Self {
        Self {
            current: Vector4::zeros(),
            previous: Vector4::zeros(),
            variance: Vector4::from_element(1e4),
            process_noise: 1.0,
        }
    }
}

impl ClockState {
    /// Random walk: the mean holds, the variance grows.
    pub fn predict(&mut self, dt: f64) {
        if dt > 0.0 {
            self.variance.add_scalar_mut(self.process_noise * dt);
        }
    }

    /// Makes the current epoch the reference of the next phase difference.
    pub fn roll(&mut self) {
        self.previous = self.current;
    }

    #[inline]
    pub fn offset(&self, system: GnssSystem) -> f64 {
        self.current[system.index()]
    }

    #[inline]
    pub fn set_offset(&mut self, system: GnssSystem, offset: f64, variance: f64) {
        self.current[system.index()] = offset;
        self.variance[system.index()] = variance;
    }
}

impl Default for State {
    fn default() -> Self {
        Self {
            rot: Rotation3::identity(),
            pos: Vector3::zeros(),
            vel: Vector3::zeros(),
            omg: Vector3::zeros(),
            acc: Vector3::new(0.0, 0.0, 9.81),
            gravity: Vector3::new(0.0, 0.0, -9.81),
            bg: Vector3::zeros(),
            ba: Vector3::zeros(),
            clock: ClockState::default(),
        }
    }
}

impl State {
    /// A state resting at `pose`, with gravity along world `-z`.
    pub fn at_rest(pose: &IsometryMatrix3<f64>, gravity: &Vector3<f64>) -> Self {
        let rot = pose.rotation;
        Self {
            rot,
            pos: pose.translation.vector,
            acc: -(rot.inverse() * gravity),
            gravity: *gravity,
            ..Default::default()
        }
    }

    #[inline]
    pub fn pose(&self) -> IsometryMatrix3<f64> {
        IsometryMatrix3::from_parts(Translation3::from(self.pos), self.rot)
    }
}

#[inline]
fn block<B: SubStateOf<State>>(delta: &ErrorState) -> Vector3<f64> {
    use nalgebra::DimName;
    delta.fixed_rows::<3>(B::Offset::DIM).into_owned()
}

#[inline]
fn set_block<B: SubStateOf<State>>(delta: &mut ErrorState, value: &Vector3<f64>) {
    use nalgebra::DimName;
    delta.fixed_rows_mut::<3>(B::Offset::DIM).copy_from(value);
}

impl Manifold for State {
    fn boxplus(&mut self, delta: &ErrorState) {
        self.rot *= Rotation3::new(block::<Rotation>(delta));
        self.rot.renormalize();
        self.pos += block::<Position>(delta);
        self.vel += block::<Velocity>(delta);
        self.omg += block::<AngularRate>(delta);
        self.acc += block::<SpecificForce>(delta);
        self.gravity += block::<Gravity>(delta);
        self.bg += block::<GyroBias>(delta);
        self.ba += block::<AccelBias>(delta);
    }

    fn boxminus(&self, origin: &Self) -> ErrorState {
        let mut delta = ErrorState::zeros();
        set_block::<Rotation>(&mut delta, &(origin.rot.inverse() * self.rot).scaled_axis());
        set_block::<Position>(&mut delta, &(self.pos - origin.pos));
        set_block::<Velocity>(&mut delta, &(self.vel - origin.vel));
        set_block::<AngularRate>(&mut delta, &(self.omg - origin.omg));
        set_block::<SpecificForce>(&mut delta, &(self.acc - origin.acc));
        set_block::<Gravity>(&mut delta, &(self.gravity - origin.gravity));
        set_block::<GyroBias>(&mut delta, &(self.bg - origin.bg));
        set_block::<AccelBias>(&mut delta, &(self.ba - origin.ba));
        delta
    }
}
