pub mod gnss;
pub mod imu;
pub mod points;

use nalgebra::DVector;

use crate::eskf::observe::{JacobianBlock, Measurement};

use super::state::State;

pub use gnss::{NmeaMeasurement, PhaseDiffGroup, PseudorangeGroup, antenna_position};
pub use imu::{ImuInit, ImuMeasurement, ImuSample};
pub use points::{LidarScan, LidarToImu, PlaneCorrespondence, PlaneMatcher, ScanPoint};

/// Every kind of row the filter fuses.
#[derive(Debug, Clone)]
pub enum Factor {
    LidarPlane(PlaneCorrespondence),
    GnssPhase(PhaseDiffGroup),
    GnssPseudorange(PseudorangeGroup),
    Nmea(NmeaMeasurement),
    ImuOnly(ImuMeasurement),
}

macro_rules! delegate {
    ($self:ident, $m:ident => $body:expr) => {
        match $self {
            Factor::LidarPlane($m) => $body,
            Factor::GnssPhase($m) => $body,
            Factor::GnssPseudorange($m) => $body,
            Factor::Nmea($m) => $body,
            Factor::ImuOnly($m) => $body,
        }
    };
}

impl Measurement<State> for Factor {
    #[inline]
    fn residual(&self, state: &State) -> DVector<f64> {
        delegate!(self, m => m.residual(state))
    }

    #[inline]
    fn jacobian_blocks(&self, state: &State) -> Vec<JacobianBlock<f64>> {
        delegate!(self, m => m.jacobian_blocks(state))
    }

    #[inline]
    fn noise(&self) -> DVector<f64> {
        delegate!(self, m => m.noise())
    }
}

impl From<PlaneCorrespondence> for Factor {
    #[inline]
    fn from(value: PlaneCorrespondence) -> Self {
        Self::LidarPlane(value)
    }
}

impl From<ImuMeasurement> for Factor {
    #[inline]
    fn from(value: ImuMeasurement) -> Self {
        Self::ImuOnly(value)
    }
}
