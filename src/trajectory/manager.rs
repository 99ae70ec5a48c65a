use log::debug;
use nalgebra::{Rotation3, Vector3};

use crate::frame::{Framed, ImuPoint, WorldPoint, frames};

use super::{PoseCurve, SplineSample, TrajectoryConfig, UniformCubicSpline};

#[derive(Debug, Clone)]
pub struct KeyPose {
    pub timestamp: f64,
    pub rotation: Rotation3<f64>,
    pub position: Vector3<f64>,
    /// Points seen from this pose, in the IMU frame.
    pub points: Vec<ImuPoint<f64>>,
}

/// Key poses since the last GNSS update, in time order.
#[derive(Debug, Clone)]
pub struct TrajectoryManager {
    key_poses: Vec<KeyPose>,
    curve: Option<PoseCurve>,
    config: TrajectoryConfig,
}

impl TrajectoryManager {
    pub fn new(config: TrajectoryConfig) -> Self {
        Self {
            key_poses: Vec::new(),
            curve: None,
            config,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.key_poses.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.key_poses.is_empty()
    }

    #[inline]
    pub fn key_poses(&self) -> &[KeyPose] {
        &self.key_poses
    }

    #[inline]
    pub fn curve(&self) -> Option<&PoseCurve> {
        self.curve.as_ref()
    }

    /// Appends a key pose if it is newer than the last one and carries
    /// points. The first pose is always taken.
    pub fn add_graph_pose(
        &mut self,
        rotation: Rotation3<f64>,
        position: Vector3<f64>,
        points: Vec<ImuPoint<f64>>,
        timestamp: f64,
    ) -> bool {
        let accepted = match self.key_poses.last() {
            None => true,
            Some(last) => timestamp > last.timestamp && !points.is_empty(),
        };
        if accepted {
            self.key_poses.push(KeyPose {
                timestamp,
                rotation,
                position,
                points,
            });
        }
        accepted
    }

    /// Pins the corrected pose at `timestamp`. A correction that is not newer
    /// than the last key pose overwrites that pose and keeps its points.
    pub fn record_correction(
        &mut self,
        timestamp: f64,
        rotation: Rotation3<f64>,
        position: Vector3<f64>,
    ) {
        match self.key_poses.last_mut() {
            Some(last) if timestamp <= last.timestamp => {
                last.rotation = rotation;
                last.position = position;
            }
            _ => self.key_poses.push(KeyPose {
                timestamp,
                rotation,
                position,
                points: Vec::new(),
            }),
        }
    }

    /// Fits a curve through every key pose, relative to the first one.
    pub fn fit_curve(&mut self) -> Option<&PoseCurve> {
        let (first, last) = (self.key_poses.first()?, self.key_poses.last()?);
        let origin = first.rotation;
        let count = self.key_poses.len();
        let samples: Vec<_> = self
            .key_poses
            .iter()
            .enumerate()
            .map(|(i, pose)| SplineSample {
                time: pose.timestamp,
                value: PoseCurve::encode(&origin, &pose.rotation, &pose.position),
                weight: if i == 0 || i + 1 == count {
                    self.config.endpoint_weight
                } else {
                    1.0
                },
            })
            .collect();

        let spline = UniformCubicSpline::fit(
            &samples,
            first.timestamp,
            last.timestamp,
            self.config.knot_interval,
            self.config.smoothness,
        );
        if spline.is_none() {
            debug!("curve fit over {count} key poses is underdetermined");
        }
        self.curve = spline.map(|spline| PoseCurve { origin, spline });
        self.curve.as_ref()
    }

    /// Every key pose's points re-projected through the fitted curve.
    pub fn updated_map_points(&self) -> Vec<WorldPoint<f64>> {
        let Some(curve) = &self.curve else {
            return Vec::new();
        };
        self.key_poses
            .iter()
            .flat_map(|pose| {
                let imu_to_world =
                    Framed::new_transform(curve.pose_at(pose.timestamp), frames::Imu, frames::World);
                pose.points
                    .iter()
                    .map(move |point| point * &imu_to_world)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.key_poses.clear();
        self.curve = None;
    }
}
