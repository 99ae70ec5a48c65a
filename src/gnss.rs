//! GNSS and NMEA measurement models.
//!
//! Satellites arrive with their ECEF positions and clocks already computed.
//! Until the local map frame is aligned to the earth the models only collect
//! (local, ECEF) position pairs. Once aligned they produce filter measurements:
//!
//! ```text
//!  NotReady ──(enough epochs, enough travel)──> READY
//!                                                 │
//!                     ┌───────────────────────────┤
//!                     │            │              │
//!               NoCorrection    Rejected      Correct(rows)
//! ```

mod align;
pub mod backend;
mod factor;
mod gate;
pub mod geodesy;
pub mod iono;
mod model;
mod nmea;
mod observation;
pub mod preintegration;
pub(crate) mod spp;

use nalgebra::DMatrix;

use crate::{
    algorithm::ligo::{measurement::Factor, state::State},
    eskf::{Eskf, observe::Stacked},
};

pub use align::{Alignment, AlignmentWindow, LocalToEcef, kabsch_yaw, local_to_ecef};
pub use factor::{
    CarrierPhaseDiffFactor, DopplerFactor, DopplerJacobians, PhaseDiffJacobians,
    PseudorangeFactor, PseudorangeJacobians,
};
pub use gate::{GateConfidence, InnovationGate, chi_square_quantile};
pub use model::{AnchorConfig, GnssConfig, GnssModel};
pub use nmea::{NmeaConfig, NmeaModel};
pub use observation::{GnssEpoch, GnssSystem, IonoParams, NmeaFix, SatelliteObservation};
pub use spp::{RangeObservation, SppSolution, solve as solve_spp};

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Readiness {
    #[default]
    NotReady,
    Ready,
}

/// One-way readiness flag: once latched it stays latched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadyLatch(Readiness);

impl ReadyLatch {
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.0 == Readiness::Ready
    }

    /// Latches, returning whether this call made the transition.
    pub fn latch(&mut self) -> bool {
        let transitioned = !self.is_ready();
        self.0 = Readiness::Ready;
        transitioned
    }
}

/// What an epoch or fix does to the filter.
#[derive(Debug)]
pub enum GnssVerdict {
    /// Still collecting pairs for the local-to-ECEF alignment.
    NotReady,
    /// Every residual is below tolerance.
    NoCorrection,
    /// Failed the innovation gate, the rest of the batch is dropped.
    Rejected,
    Correct(Vec<Factor>),
}

/// Gates `measurements` at the predicted filter.
///
/// `clock_params` is the number of nuisance clocks that were removed from
/// the residuals, each one costs a degree of freedom.
pub(crate) fn judge(
    eskf: &Eskf<State>,
    measurements: Vec<Factor>,
    clock_params: usize,
    tolerance: f64,
    gate: &InnovationGate,
) -> GnssVerdict {
    if measurements.is_empty() {
        return GnssVerdict::NoCorrection;
    }
    let stacked = Stacked::new(&eskf.state, &measurements);
    if stacked.rows() == 0 || stacked.residual.amax() < tolerance {
        return GnssVerdict::NoCorrection;
    }

    let innovation_cov = &stacked.jacobian * &*eskf.cov * stacked.jacobian.transpose()
        + DMatrix::from_diagonal(&stacked.noise);
    let dof = stacked.rows().saturating_sub(clock_params).max(1);
    if gate.accepts(&stacked.residual, innovation_cov, dof) {
        GnssVerdict::Correct(measurements)
    } else {
        log::warn!(
            "gnss innovation rejected, max residual {:.3} m over {} rows",
            stacked.residual.amax(),
            stacked.rows()
        );
        GnssVerdict::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_transitions_once() {
        let mut latch = ReadyLatch::default();
        assert!(!latch.is_ready());
        assert!(latch.latch());
        assert!(!latch.latch());
        assert!(latch.is_ready());
    }
}
