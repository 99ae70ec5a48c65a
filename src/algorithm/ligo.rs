//! Tightly-coupled LiDAR / inertial / GNSS odometry.
//!
//! # Input
//! ```text
//! ├──┬───┬───┬───┬───┬───┬───┬───┬───┬──>  IMU
//!    │       ╰── GNSS epoch      │
//!    ╰─┤ LiDAR scan, grouped by point time ├─╯
//! ```
//!
//! Producers push through a [`SensorSender`]. Every point group first merges
//! the IMU, GNSS and NMEA events older than itself, earliest first, then
//! corrects the state against the map and grows the map.

pub mod config;
pub mod downsample;
pub mod measurement;
pub mod predict;
pub mod queues;
mod scheduler;
pub mod state;

use log::info;
use nalgebra::{IsometryMatrix3, Point3, Vector3};

use crate::{
    error::{Error, Result},
    eskf::Eskf,
    frame::{Framed, WorldPoint, frames},
    gnss::{GnssModel, NmeaModel, backend::GraphBackend},
    ivox::Ivox,
    trajectory::MappingWindow,
};

pub use config::Config;
use downsample::Downsampler;
use measurement::{ImuSample, LidarToImu};
use predict::PropagationInput;
pub use queues::{SensorMessage, SensorSender};
use queues::SensorQueues;
pub use scheduler::{Flow, SpinOutcome};
use state::State;

/// Finds the sensor in a prior map from one scan.
pub trait Relocalizer {
    /// `scan` is in the IMU frame. Returns the IMU pose in the map.
    fn relocalize(&mut self, scan: &[Point3<f64>], map: &Ivox<f64>) -> Option<IsometryMatrix3<f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemStatus {
    /// Collecting the samples the initial state is built from.
    WaitingForData,
    /// Initialized, but not yet placed in the prior map.
    Relocalizing,
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Odometry {
    pub timestamp: f64,
    pub pose: IsometryMatrix3<f64>,
    pub velocity: Vector3<f64>,
}

/// Everything the loop mutates, in one place.
pub struct EstimatorContext {
    pub config: Config,
    pub eskf: Eskf<State>,
    status: SystemStatus,
    window: MappingWindow,
    downsampler: Downsampler,
    extrinsic: LidarToImu,
    gnss: Option<GnssModel>,
    nmea: Option<NmeaModel>,
    backend: Option<Box<dyn GraphBackend>>,
    relocalizer: Option<Box<dyn Relocalizer>>,
    /// Raw accelerometer unit to m/s².
    acc_scale: f64,
    last_imu: Option<ImuSample>,
    path: Vec<Odometry>,
}

impl EstimatorContext {
    fn new(config: Config) -> Self {
        let sensors = config.sensors;
        let gravity = config.imu.gravity();
        let eskf = Eskf::new_with_state(
            State::at_rest(&IsometryMatrix3::identity(), &gravity),
            config.filter.init_cov,
            config.process_noise.covariance(config.imu.imu_as_input),
            0.0,
        );
        Self {
            eskf,
            status: SystemStatus::WaitingForData,
            window: MappingWindow::new(config.ivox.clone(), config.trajectory.clone()),
            downsampler: Downsampler::new(config.lidar.downsample_resolution),
            extrinsic: config.lidar.extrinsic(),
            gnss: sensors.gnss.then(|| GnssModel::new(config.gnss.clone())),
            nmea: sensors.nmea.then(|| NmeaModel::new(config.nmea.clone())),
            backend: None,
            relocalizer: None,
            acc_scale: 1.0,
            last_imu: None,
            path: Vec::new(),
            config,
        }
    }

    /// What drives propagation between events.
    fn propagation_input(&self) -> PropagationInput {
        match (&self.last_imu, self.config.imu.imu_as_input) {
            (Some(sample), true) => PropagationInput::Imu {
                gyro: sample.angular_velocity,
                acc: sample.linear_acceleration * self.acc_scale,
            },
            _ => PropagationInput::Output,
        }
    }

    fn publish(&mut self) {
        let odometry = Odometry {
            timestamp: self.eskf.last_update_time.mean,
            pose: self.eskf.state.pose(),
            velocity: self.eskf.state.vel,
        };
        if self
            .path
            .last()
            .is_none_or(|last| last.timestamp < odometry.timestamp)
        {
            self.path.push(odometry);
        }
    }
}

/// The estimator: the context plus the sensor buffers feeding it.
pub struct Estimator {
    context: EstimatorContext,
    queues: SensorQueues,
}

impl Estimator {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        info!(
            "estimator configured: lidar {}, imu {} (as input: {}), gnss {}, nmea {}",
            config.sensors.lidar,
            config.sensors.imu,
            config.imu.imu_as_input,
            config.sensors.gnss,
            config.sensors.nmea,
        );
        let queues = SensorQueues::new(config.sensors);
        Ok(Self {
            context: EstimatorContext::new(config),
            queues,
        })
    }

    /// Attaches the factor-graph back end fed by every applied GNSS epoch.
    pub fn with_backend(mut self, backend: Box<dyn GraphBackend>) -> Self {
        self.context.backend = Some(backend);
        self
    }

    pub fn with_relocalizer(mut self, relocalizer: Box<dyn Relocalizer>) -> Self {
        self.context.relocalizer = Some(relocalizer);
        self
    }

    /// Loads a prior map to localize in.
    pub fn load_prior_map(
        &mut self,
        points: impl IntoIterator<Item = Point3<f64>>,
    ) -> Result<usize> {
        if !self.context.config.map.prior_map {
            return Err(Error::InvalidConfig(
                "prior map given but map.prior_map is off".to_owned(),
            ));
        }
        self.context.window.load_prior(
            points.into_iter().map(WorldPoint::new),
            self.context.config.map.min_prior_points,
        )
    }

    #[inline]
    pub fn sender(&self) -> SensorSender {
        self.queues.sender()
    }

    #[inline]
    pub fn context(&self) -> &EstimatorContext {
        &self.context
    }

    #[inline]
    pub fn status(&self) -> SystemStatus {
        self.context.status
    }

    /// Whether initialization, and relocalization if any, is complete.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.context.status == SystemStatus::Running
    }

    pub fn odometry(&self) -> Option<Odometry> {
        self.is_valid().then(|| Odometry {
            timestamp: self.context.eskf.last_update_time.mean,
            pose: self.context.eskf.state.pose(),
            velocity: self.context.eskf.state.vel,
        })
    }

    /// IMU-to-world transform of the current estimate.
    pub fn pose(&self) -> Framed<IsometryMatrix3<f64>, fn(frames::Imu) -> frames::World> {
        Framed::new_transform(self.context.eskf.state.pose(), frames::Imu, frames::World)
    }

    #[inline]
    pub fn map_points(&self) -> impl Iterator<Item = &Point3<f64>> {
        self.context.window.map().points()
    }

    #[inline]
    pub fn map(&self) -> &Ivox<f64> {
        self.context.window.map()
    }

    /// Every published odometry, oldest first.
    #[inline]
    pub fn path(&self) -> &[Odometry] {
        &self.context.path
    }

    #[inline]
    pub fn gnss(&self) -> Option<&GnssModel> {
        self.context.gnss.as_ref()
    }

    #[inline]
    pub fn nmea(&self) -> Option<&NmeaModel> {
        self.context.nmea.as_ref()
    }
}
