use std::path::Path;

use nalgebra::{IsometryMatrix3, Matrix3, Rotation3, Translation3, Vector3};
use serde::Deserialize;

use crate::{
    error::{Error, Result},
    eskf::observe::IterationConfig,
    frame::{Framed, frames},
    gnss::{GnssConfig, NmeaConfig},
    ivox,
    trajectory::TrajectoryConfig,
};

use super::{measurement::LidarToImu, predict::ProcessNoiseConfig};

/// Everything the estimator reads at start-up, as one TOML document.
///
/// Every section and key may be omitted, missing values take the defaults
/// below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensors: SensorConfig,
    pub imu: ImuConfig,
    pub process_noise: ProcessNoiseConfig,
    pub lidar: LidarConfig,
    pub filter: FilterConfig,
    pub ivox: ivox::Config<f64>,
    pub trajectory: TrajectoryConfig,
    pub gnss: GnssConfig,
    pub nmea: NmeaConfig,
    pub map: MapConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub lidar: bool,
    pub imu: bool,
    pub gnss: bool,
    pub nmea: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            lidar: true,
            imu: true,
            gnss: false,
            nmea: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Drive propagation with the IMU readings instead of fusing them as
    /// measurements of the state's own rates.
    pub imu_as_input: bool,
    /// Gravity in the world frame, m/s².
    pub gravity: [f64; 3],
    /// Accelerometer norm at rest in the sensor's unit. Estimated from the
    /// initialization samples when absent.
    pub acc_norm: Option<f64>,
    /// Saturation of the raw accelerometer, in the sensor's unit.
    pub satu_acc: f64,
    /// Saturation of the gyroscope, rad/s.
    pub satu_gyro: f64,
    pub gyro_noise: f64,
    pub acc_noise: f64,
    /// Samples averaged before the system starts.
    pub init_samples: usize,
    /// Advance the covariance on IMU events and only the mean on LiDAR groups.
    pub cov_at_imu_rate: bool,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            imu_as_input: false,
            gravity: [0.0, 0.0, -9.81],
            acc_norm: None,
            satu_acc: 3.0,
            satu_gyro: 35.0,
            gyro_noise: 0.01,
            acc_noise: 0.05,
            init_samples: 20,
            cov_at_imu_rate: false,
        }
    }
}

impl ImuConfig {
    #[inline]
    pub fn gravity(&self) -> Vector3<f64> {
        Vector3::from(self.gravity)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LidarConfig {
    /// LiDAR origin in the IMU frame.
    pub extrinsic_translation: [f64; 3],
    /// Row-major rotation from the LiDAR to the IMU frame.
    pub extrinsic_rotation: [f64; 9],
    /// Points closer than this are dropped.
    pub blind: f64,
    /// Keep every n-th raw point.
    pub point_filter_num: usize,
    pub downsample_resolution: f64,
    pub num_match_points: usize,
    pub max_match_distance: f64,
    /// Largest distance of a neighbour from its fitted plane.
    pub plane_threshold: f64,
    /// A match is kept if `‖p_lidar‖ > match_s · pd²`.
    pub match_s: f64,
    pub laser_point_cov: f64,
    /// Fewer matched points than this skips the group's update.
    pub min_effective_points: usize,
}

impl Default for LidarConfig {
    fn default() -> Self {
        Self {
            extrinsic_translation: [0.0; 3],
            extrinsic_rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            blind: 0.5,
            point_filter_num: 1,
            downsample_resolution: 0.5,
            num_match_points: 5,
            max_match_distance: 3.0,
            plane_threshold: 0.1,
            match_s: 81.0,
            laser_point_cov: 0.01,
            min_effective_points: 1,
        }
    }
}

impl LidarConfig {
    pub fn extrinsic(&self) -> LidarToImu {
        let rotation = Rotation3::from_matrix(&Matrix3::from_row_slice(&self.extrinsic_rotation));
        Framed::new_transform(
            IsometryMatrix3::from_parts(Translation3::from(self.extrinsic_translation), rotation),
            frames::Lidar,
            frames::Imu,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    /// Isotropic prior variance at start-up and after a re-initialization.
    pub init_cov: f64,
    /// Variance growth of each receiver clock, m²/s.
    pub clock_process_noise: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let iteration = IterationConfig::default();
        Self {
            max_iterations: iteration.max_iterations,
            convergence_threshold: iteration.convergence_threshold,
            init_cov: 0.01,
            clock_process_noise: 1.0,
        }
    }
}

impl FilterConfig {
    #[inline]
    pub fn iteration(&self) -> IterationConfig<f64> {
        IterationConfig {
            max_iterations: self.max_iterations,
            convergence_threshold: self.convergence_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Localize in a prior map instead of building one from scratch.
    pub prior_map: bool,
    pub min_prior_points: usize,
    /// Starting pose as `[x, y, z, roll, pitch, yaw]`, used when there is no
    /// relocalizer.
    pub init_pose: Option<[f64; 6]>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            prior_map: false,
            min_prior_points: 100,
            init_pose: None,
        }
    }
}

impl MapConfig {
    pub fn init_pose(&self) -> Option<IsometryMatrix3<f64>> {
        self.init_pose.map(|[x, y, z, roll, pitch, yaw]| {
            IsometryMatrix3::from_parts(
                Translation3::new(x, y, z),
                Rotation3::from_euler_angles(roll, pitch, yaw),
            )
        })
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Rejects values the estimator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(Error::InvalidConfig(message.to_owned()));
        if !self.sensors.lidar && !self.sensors.imu {
            return invalid("at least one of LiDAR and IMU must be enabled");
        }
        if !self.sensors.lidar && !(self.sensors.gnss || self.sensors.nmea) {
            return invalid("running without LiDAR needs GNSS or NMEA");
        }
        if self.sensors.gnss && self.sensors.nmea {
            return invalid("GNSS and NMEA cannot be fused at the same time");
        }
        if self.imu.imu_as_input && !self.sensors.imu {
            return invalid("imu_as_input needs the IMU");
        }
        if self.lidar.downsample_resolution <= 0.0 || self.ivox.resolution <= 0.0 {
            return invalid("resolutions must be positive");
        }
        if self.ivox.insert_spacing <= 0.0 {
            return invalid("ivox insert_spacing must be positive");
        }
        if self.lidar.num_match_points < 3 {
            return invalid("a plane needs at least 3 match points");
        }
        if self.filter.max_iterations == 0 {
            return invalid("max_iterations must be at least 1");
        }
        if self.filter.init_cov <= 0.0 {
            return invalid("init_cov must be positive");
        }
        if self.trajectory.knot_interval <= 0.0 {
            return invalid("knot_interval must be positive");
        }
        Ok(())
    }
}
