//! Interface to a nonlinear least-squares back end.
//!
//! The solver itself lives outside this crate. The GNSS model only builds the
//! variables and factors and reads estimates back.

use nalgebra::{Rotation3, Vector3, Vector4};

use crate::error::Result;

use super::{
    factor::{CarrierPhaseDiffFactor, DopplerFactor, PseudorangeFactor},
    preintegration::{FrameEstimate, ImuPreintegration},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// ECEF position of the local origin.
    Anchor,
    /// `R_ecef_local`.
    Orientation,
    /// Position and velocity of frame `i`.
    Frame(usize),
    FrameRotation(usize),
    /// Per-constellation receiver clocks at frame `i`.
    Clock(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Point(Vector3<f64>),
    Rotation(Rotation3<f64>),
    Frame {
        position: Vector3<f64>,
        velocity: Vector3<f64>,
    },
    Clock(Vector4<f64>),
}

#[derive(Debug, Clone)]
pub enum GraphFactor {
    CarrierPhaseDiff {
        factor: CarrierPhaseDiffFactor,
        frame_i: usize,
        frame_j: usize,
    },
    Pseudorange {
        factor: PseudorangeFactor,
        frame: usize,
    },
    /// Velocity of `frame_j`, clock drift from `frame_i` to `frame_j`.
    Doppler {
        factor: DopplerFactor,
        frame_i: usize,
        frame_j: usize,
    },
    PreintegratedImu {
        frame_i: usize,
        frame_j: usize,
        preintegration: Box<ImuPreintegration>,
        gravity: Vector3<f64>,
    },
    PosePrior {
        frame: usize,
        pose: FrameEstimate,
        information: f64,
    },
}

pub trait GraphBackend {
    fn add_variable(&mut self, key: Key, value: Variable);
    fn add_factor(&mut self, factor: GraphFactor);
    fn optimize(&mut self) -> Result<()>;
    fn current_estimate(&self, key: Key) -> Option<Variable>;
}

/// Reads a whole frame back from the back end.
pub fn frame_estimate(backend: &dyn GraphBackend, frame: usize) -> Option<FrameEstimate> {
    let Some(Variable::Frame { position, velocity }) = backend.current_estimate(Key::Frame(frame))
    else {
        return None;
    };
    let Some(Variable::Rotation(rotation)) = backend.current_estimate(Key::FrameRotation(frame))
    else {
        return None;
    };
    Some(FrameEstimate {
        rotation,
        position,
        velocity,
    })
}
