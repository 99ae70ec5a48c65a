use log::info;
use nalgebra::{Point3, Vector3};
use serde::Deserialize;

use crate::{
    algorithm::ligo::{
        measurement::{
            Factor,
            gnss::{NmeaMeasurement, antenna_position},
        },
        state::State,
    },
    eskf::Eskf,
};

use super::{
    GnssVerdict, ReadyLatch,
    align::{AlignmentWindow, LocalToEcef},
    gate::{GateConfidence, InnovationGate},
    geodesy::rotation_ecef_enu_at,
    judge,
    observation::NmeaFix,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NmeaConfig {
    /// Fix time minus local time, in seconds.
    pub time_offset: f64,
    pub lever_arm: [f64; 3],
    pub min_init_fixes: usize,
    pub min_init_travel: f64,
    /// Used when a fix carries no covariance.
    pub position_std: f64,
    pub velocity_std: f64,
    pub no_correction_tol: f64,
    pub gate: GateConfidence,
}

impl Default for NmeaConfig {
    fn default() -> Self {
        Self {
            time_offset: 0.0,
            lever_arm: [0.0; 3],
            min_init_fixes: 5,
            min_init_travel: 5.0,
            position_std: 0.05,
            velocity_std: 0.1,
            no_correction_tol: 1e-3,
            gate: GateConfidence::default(),
        }
    }
}

/// Loosely-coupled model for receiver position fixes.
pub struct NmeaModel {
    config: NmeaConfig,
    lever_arm: Vector3<f64>,
    gate: InnovationGate,
    latch: ReadyLatch,
    transform: Option<LocalToEcef>,
    window: AlignmentWindow,
    current: Option<NmeaFix>,
}

impl NmeaModel {
    pub fn new(config: NmeaConfig) -> Self {
        Self {
            lever_arm: Vector3::from(config.lever_arm),
            gate: InnovationGate::new(config.gate),
            config,
            latch: ReadyLatch::default(),
            transform: None,
            window: AlignmentWindow::default(),
            current: None,
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.latch.is_ready()
    }

    #[inline]
    pub fn transform(&self) -> Option<&LocalToEcef> {
        self.transform.as_ref()
    }

    #[inline]
    pub fn local_time(&self, fix_time: f64) -> f64 {
        fix_time - self.config.time_offset
    }

    pub fn process_nmea(&mut self, fix: &NmeaFix, state: &State) {
        if !self.latch.is_ready() {
            self.window
                .push(antenna_position(state, &self.lever_arm), fix.position);
        }
        self.current = Some(fix.clone());
    }

    pub fn evaluate(&mut self, eskf: &Eskf<State>) -> GnssVerdict {
        if !self.latch.is_ready() {
            let Some(alignment) = self
                .window
                .solve(self.config.min_init_fixes, self.config.min_init_travel)
            else {
                return GnssVerdict::NotReady;
            };
            info!(
                "nmea aligned after {} fixes, yaw {:.4} rad",
                self.window.len(),
                alignment.yaw
            );
            self.latch.latch();
            self.transform = Some(alignment.transform);
            self.window.clear();
        }

        let (Some(transform), Some(fix)) = (&self.transform, &self.current) else {
            return GnssVerdict::NoCorrection;
        };

        let rotation_local_ecef = transform.rotation.inverse();
        let position = transform
            .inverse_transform_point(&Point3::from(fix.position))
            .coords;
        let position_variance = match &fix.covariance {
            Some(covariance) => {
                let enu_to_local = rotation_local_ecef * rotation_ecef_enu_at(&fix.position);
                let local = enu_to_local.matrix() * covariance * enu_to_local.matrix().transpose();
                local.diagonal()
            }
            None => Vector3::repeat(self.config.position_std.powi(2)),
        };

        let measurement = NmeaMeasurement {
            position,
            velocity: fix.velocity.map(|velocity| rotation_local_ecef * velocity),
            lever_arm: self.lever_arm,
            position_variance,
            velocity_variance: self.config.velocity_std.powi(2),
        };
        judge(
            eskf,
            vec![Factor::Nmea(measurement)],
            0,
            self.config.no_correction_tol,
            &self.gate,
        )
    }

    pub fn epoch_done(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        eskf::Covariance,
        gnss::{
            align::local_to_ecef,
            geodesy::{Geodetic, geodetic_to_ecef},
        },
    };

    #[test]
    fn test_fixes_align_then_correct() {
        let anchor = geodetic_to_ecef(&Geodetic {
            latitude: -0.6,
            longitude: 0.3,
            height: 100.0,
        });
        let truth = local_to_ecef(anchor, rotation_ecef_enu_at(&anchor), 2.0);
        let mut model = NmeaModel::new(NmeaConfig::default());
        let mut eskf = Eskf::new_with_state(State::default(), 1e-2, Covariance::default(), 0.0);

        for i in 0..6 {
            eskf.state.pos = Vector3::new(0.0, 1.5 * i as f64, 0.0);
            let fix = NmeaFix {
                time: i as f64,
                position: truth.transform_point(&Point3::from(eskf.state.pos)).coords,
                velocity: None,
                covariance: None,
            };
            model.process_nmea(&fix, &eskf.state);
            let verdict = model.evaluate(&eskf);
            if i < 4 {
                assert!(matches!(verdict, GnssVerdict::NotReady));
            } else {
                assert!(model.is_ready());
                assert!(matches!(verdict, GnssVerdict::NoCorrection));
            }
            model.epoch_done();
        }

        // a fix 20 cm off is a correction, 50 m off fails the gate
        let shifted = |offset: Vector3<f64>| NmeaFix {
            time: 6.0,
            position: truth
                .transform_point(&Point3::from(eskf.state.pos + offset))
                .coords,
            velocity: None,
            covariance: None,
        };
        model.process_nmea(&shifted(Vector3::new(0.2, 0.0, 0.0)), &eskf.state);
        assert!(matches!(model.evaluate(&eskf), GnssVerdict::Correct(_)));
        model.process_nmea(&shifted(Vector3::new(50.0, 0.0, 0.0)), &eskf.state);
        assert!(matches!(model.evaluate(&eskf), GnssVerdict::Rejected));
    }
}
