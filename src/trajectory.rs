//! Key poses of the mapping window and the retroactive map rewrite.
//!
//! ```text
//!  key poses  ●───●───●───●───●          (IMU-frame points attached)
//!                              ╲
//!  correction                   ◆         GNSS moved the last pose
//!                                         │
//!  curve      ○───○───○───○───○───◆  <────╯ fitted through all of them
//!                                         │
//!  map        snapshot + points re-projected along the curve
//! ```

mod manager;
mod spline;
mod window;

use nalgebra::{IsometryMatrix3, Rotation3, Translation3, Vector3, Vector6};
use serde::Deserialize;

pub use manager::{KeyPose, TrajectoryManager};
pub use spline::{SplineSample, UniformCubicSpline};
pub use window::{MappingWindow, Replay};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Smallest position change of a correction that rewrites the map.
    pub correction_threshold: f64,
    /// Fewest key poses a rewrite needs.
    pub min_keyframes: usize,
    /// Knot spacing of the fitted curve, seconds.
    pub knot_interval: f64,
    /// Weight of the first and last key pose in the fit.
    pub endpoint_weight: f64,
    /// Weight of the second-difference penalty on the control points.
    pub smoothness: f64,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            correction_threshold: 0.1,
            min_keyframes: 5,
            knot_interval: 0.025,
            endpoint_weight: 100.0,
            smoothness: 1e-3,
        }
    }
}

/// A continuous pose: position and the rotation tangent relative to
/// `origin`, both on one spline.
#[derive(Debug, Clone)]
pub struct PoseCurve {
    origin: Rotation3<f64>,
    spline: UniformCubicSpline<6>,
}

impl PoseCurve {
    #[inline]
    fn encode(origin: &Rotation3<f64>, rotation: &Rotation3<f64>, position: &Vector3<f64>) -> Vector6<f64> {
        let tangent = (origin.inverse() * rotation).scaled_axis();
        Vector6::new(
            position.x, position.y, position.z, tangent.x, tangent.y, tangent.z,
        )
    }

    pub fn pose_at(&self, time: f64) -> IsometryMatrix3<f64> {
        let value = self.spline.evaluate(time);
        let position = value.fixed_rows::<3>(0).into_owned();
        let tangent = value.fixed_rows::<3>(3).into_owned();
        IsometryMatrix3::from_parts(
            Translation3::from(position),
            self.origin * Rotation3::new(tangent),
        )
    }
}
