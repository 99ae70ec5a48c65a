use log::warn;
use nalgebra::{DVector, Point3, SymmetricEigen, Vector3};

use crate::{
    algorithm::ligo::{config::LidarConfig, state::State},
    eskf::observe::{JacobianBlock, Measurement, RejectReason, dynamic},
    frame::{Framed, ImuPoint, IsometryFramed, LidarPoint, WorldPoint, frames},
    ivox::Ivox,
    utils::VectorSquareSum,
};

use super::super::state::marker::{Position, Rotation};

pub type LidarToImu = IsometryFramed<f64, fn(frames::Lidar) -> frames::Imu>;

#[derive(Debug, Clone, PartialEq)]
pub struct ScanPoint {
    pub position: Point3<f64>,
    pub intensity: f32,
    /// Seconds after the scan timestamp.
    pub time_offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LidarScan {
    pub timestamp: f64,
    pub points: Vec<ScanPoint>,
}

impl LidarScan {
    /// Time of the last point.
    pub fn end_time(&self) -> f64 {
        self.points
            .iter()
            .map(|point| point.time_offset)
            .fold(self.timestamp, |end, offset| end.max(self.timestamp + offset))
    }
}

/// One LiDAR point lying on a fitted map plane `n·x + d = 0`.
#[derive(Debug, Clone)]
pub struct PlaneCorrespondence {
    pub point_imu: Vector3<f64>,
    pub normal: Vector3<f64>,
    pub offset: f64,
    pub noise: f64,
}

impl PlaneCorrespondence {
    #[inline]
    fn distance(&self, state: &State) -> f64 {
        self.normal.dot(&(state.rot * self.point_imu + state.pos)) + self.offset
    }
}

impl Measurement<State> for PlaneCorrespondence {
    fn residual(&self, state: &State) -> DVector<f64> {
        DVector::from_element(1, -self.distance(state))
    }

    fn jacobian_blocks(&self, state: &State) -> Vec<JacobianBlock<f64>> {
        // ∂(n·(R Exp(δθ) p))/∂δθ = ([p]× Rᵀ n)ᵀ
        let rotation = self.point_imu.cross_matrix() * (state.rot.transpose() * self.normal);
        vec![
            JacobianBlock::of::<Rotation, State>(dynamic(&rotation.transpose())),
            JacobianBlock::of::<Position, State>(dynamic(&self.normal.transpose())),
        ]
    }

    fn noise(&self) -> DVector<f64> {
        DVector::from_element(1, self.noise)
    }
}

/// Least-squares plane through `points` as `(n, d)` with `n·x + d = 0`,
/// if every point is within `threshold` of it.
pub fn fit_plane(points: &[Point3<f64>], threshold: f64) -> Option<(Vector3<f64>, f64)> {
    if points.len() < 3 {
        return None;
    }
    let sum = points
        .iter()
        .map(|point| &point.coords)
        .sum::<VectorSquareSum<f64>>();
    let (center, covariance) = sum.mean();

    let SymmetricEigen {
        eigenvectors,
        eigenvalues,
    } = covariance.symmetric_eigen();
    let normal = eigenvectors.column(eigenvalues.imin()).normalize();
    let offset = -normal.dot(&center);

    points
        .iter()
        .all(|point| (normal.dot(&point.coords) + offset).abs() <= threshold)
        .then_some((normal, offset))
}

/// Matches scan points against planes of the map.
#[derive(Debug, Clone, Copy)]
pub struct PlaneMatcher<'a> {
    pub map: &'a Ivox<f64>,
    pub config: &'a LidarConfig,
}

impl<'a> PlaneMatcher<'a> {
    pub const fn new(map: &'a Ivox<f64>, config: &'a LidarConfig) -> Self {
        Self { map, config }
    }

    /// Matches one scan point against the map at `state`.
    pub fn correspondence(
        &self,
        point: &ScanPoint,
        lidar_to_imu: &LidarToImu,
        state: &State,
    ) -> Option<PlaneCorrespondence> {
        let config = self.config;
        let imu_to_world = Framed::new_transform(state.pose(), frames::Imu, frames::World);
        let point_imu: ImuPoint<f64> = &LidarPoint::new(point.position) * lidar_to_imu;
        let point_world: WorldPoint<f64> = &point_imu * &imu_to_world;

        let near = self.map.nearest(
            &point_world,
            config.num_match_points,
            config.max_match_distance,
        );
        if near.len() < config.num_match_points {
            return None;
        }
        let (normal, offset) = fit_plane(&near, config.plane_threshold)?;

        let distance = normal.dot(&point_world.coords) + offset;
        (point.position.coords.norm() > config.match_s * distance * distance).then(|| {
            PlaneCorrespondence {
                point_imu: point_imu.coords,
                normal,
                offset,
                noise: config.laser_point_cov,
            }
        })
    }

    /// Matches a point group, rejecting it when too few points find a plane.
    pub fn correspondences(
        &self,
        points: &[ScanPoint],
        lidar_to_imu: &LidarToImu,
        state: &State,
    ) -> Result<Vec<PlaneCorrespondence>, RejectReason> {
        let found: Vec<_> = points
            .iter()
            .filter_map(|point| self.correspondence(point, lidar_to_imu, state))
            .collect();
        if found.len() < self.config.min_effective_points {
            warn!(
                "only {} of {} points matched a plane, skipping the update",
                found.len(),
                points.len()
            );
            return Err(RejectReason::TooFewCorrespondences);
        }
        Ok(found)
    }
}

/// World-frame positions of `points` at `state`.
pub fn to_world<'a>(
    points: impl IntoIterator<Item = &'a ScanPoint>,
    lidar_to_imu: &LidarToImu,
    state: &State,
) -> impl Iterator<Item = WorldPoint<f64>> {
    let lidar_to_world = lidar_to_imu.clone()
        * Framed::new_transform(state.pose(), frames::Imu, frames::World);
    points
        .into_iter()
        .map(move |point| &LidarPoint::new(point.position) * &lidar_to_world)
}

/// IMU-frame positions of `points`, as kept by the trajectory manager.
pub fn to_imu<'a>(
    points: impl IntoIterator<Item = &'a ScanPoint>,
    lidar_to_imu: &'a LidarToImu,
) -> impl Iterator<Item = ImuPoint<f64>> {
    points
        .into_iter()
        .map(move |point| &LidarPoint::new(point.position) * lidar_to_imu)
}
