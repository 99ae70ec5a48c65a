use nalgebra::{IsometryMatrix3, Point3};

use super::Framed;

/// The LiDAR sensor frame, in which scan points arrive.
#[derive(Debug)]
pub struct Lidar;

/// The IMU frame, which the filter state tracks.
#[derive(Debug)]
pub struct Imu;

/// The local map frame, gravity aligned.
#[derive(Debug)]
pub struct World;

/// Earth-centered, earth-fixed.
#[derive(Debug)]
pub struct Ecef;

pub type LidarFramed<T> = Framed<T, Lidar>;
pub type ImuFramed<T> = Framed<T, Imu>;
pub type WorldFramed<T> = Framed<T, World>;

pub type IsometryFramed<T, F> = Framed<IsometryMatrix3<T>, F>;

pub type FramedPoint<T, F> = Framed<Point3<T>, F>;
pub type LidarPoint<T> = LidarFramed<Point3<T>>;
pub type ImuPoint<T> = ImuFramed<Point3<T>>;
pub type WorldPoint<T> = WorldFramed<Point3<T>>;
