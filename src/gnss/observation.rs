use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;

/// Constellations with their own receiver clock offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GnssSystem {
    Gps,
    Glonass,
    Galileo,
    BeiDou,
}

impl GnssSystem {
    pub const COUNT: usize = 4;
    pub const ALL: [Self; Self::COUNT] = [Self::Gps, Self::Glonass, Self::Galileo, Self::BeiDou];

    /// Slot of this system in per-constellation vectors.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// One tracked satellite in an epoch.
///
/// Orbits are computed upstream, the satellite position is the ECEF position
/// at signal transmission and its clock bias is already scaled to meters.
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteObservation {
    pub system: GnssSystem,
    pub prn: u16,
    pub pseudorange: f64,
    /// Carrier phase in meters, `None` without phase lock.
    pub carrier_phase: Option<f64>,
    /// Pseudorange rate in m/s, `None` when not tracked.
    pub doppler: Option<f64>,
    pub position: Vector3<f64>,
    pub clock_bias: f64,
}

/// All satellites observed at one receiver time, in GNSS time seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GnssEpoch {
    pub time: f64,
    pub satellites: Vec<SatelliteObservation>,
}

/// Broadcast Klobuchar coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct IonoParams {
    pub alpha: [f64; 4],
    pub beta: [f64; 4],
}

/// A receiver-computed position fix.
#[derive(Debug, Clone, PartialEq)]
pub struct NmeaFix {
    pub time: f64,
    /// ECEF antenna position.
    pub position: Vector3<f64>,
    /// ECEF antenna velocity.
    pub velocity: Option<Vector3<f64>>,
    /// Position covariance in the local east-north-up frame.
    pub covariance: Option<Matrix3<f64>>,
}

