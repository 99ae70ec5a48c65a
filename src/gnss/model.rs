use log::{debug, info, warn};
use nalgebra::{Point3, Vector3};
use serde::Deserialize;

use crate::{
    algorithm::ligo::{
        measurement::{
            Factor,
            gnss::{PhaseDiffGroup, PseudorangeGroup, antenna_position},
        },
        state::State,
    },
    error::{Error, Result},
    eskf::Eskf,
};

use super::{
    GnssSystem, GnssVerdict, ReadyLatch,
    align::{AlignmentWindow, LocalToEcef, local_to_ecef},
    backend::{GraphBackend, GraphFactor, Key, Variable, frame_estimate},
    factor::{CarrierPhaseDiffFactor, DopplerFactor, PseudorangeFactor},
    gate::{GateConfidence, InnovationGate},
    geodesy::{ecef_to_geodetic, elevation_azimuth, rotation_ecef_enu_at},
    iono::klobuchar_delay,
    judge,
    observation::{GnssEpoch, IonoParams},
    preintegration::{FrameEstimate, ImuPreintegration, PreintegrationNoise},
    spp::{self, RangeObservation},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GnssConfig {
    /// GNSS time minus local time, in seconds.
    pub time_offset: f64,
    /// Antenna position in the IMU frame.
    pub lever_arm: [f64; 3],
    pub min_elevation_deg: f64,
    pub min_init_epochs: usize,
    /// Horizontal travel needed before the yaw is observable.
    pub min_init_travel: f64,
    pub pseudorange_std: f64,
    pub phase_std: f64,
    /// Pseudorange rate noise, m/s.
    pub doppler_std: f64,
    /// Longest gap between two epochs whose phases are still differenced.
    pub max_phase_interval: f64,
    pub no_correction_tol: f64,
    pub gate: GateConfidence,
    /// Known ECEF anchor and yaw, skips the motion-based alignment.
    pub anchor: Option<AnchorConfig>,
    pub preintegration: PreintegrationNoise,
    /// Longest IMU interval still pre-integrated. A longer gap leaves the
    /// next back-end frame without an inertial link.
    pub max_imu_gap: f64,
    /// Information of the first back-end frame prior.
    pub prior_information: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AnchorConfig {
    pub ecef: [f64; 3],
    pub yaw: f64,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            time_offset: 0.0,
            lever_arm: [0.0; 3],
            min_elevation_deg: 15.0,
            min_init_epochs: 10,
            min_init_travel: 10.0,
            pseudorange_std: 5.0,
            phase_std: 0.05,
            doppler_std: 0.5,
            max_phase_interval: 2.0,
            no_correction_tol: 1e-3,
            gate: GateConfidence::default(),
            anchor: None,
            preintegration: PreintegrationNoise::default(),
            max_imu_gap: 0.5,
            prior_information: 100.0,
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedSatellite {
    system: GnssSystem,
    prn: u16,
    position: Vector3<f64>,
    /// Pseudorange corrected for satellite clock and ionosphere.
    range: f64,
    /// Carrier phase corrected the same way.
    phase: Option<f64>,
    /// Raw pseudorange rate.
    rate: Option<f64>,
    clock_bias: f64,
}

impl TrackedSatellite {
    fn range_observation(&self) -> RangeObservation {
        RangeObservation {
            system: self.system,
            satellite: self.position,
            range: self.range,
        }
    }
}

#[derive(Debug, Clone)]
struct EpochGeometry {
    time: f64,
    satellites: Vec<TrackedSatellite>,
    /// Local antenna position, refreshed from the posterior when the epoch is done.
    antenna: Vector3<f64>,
    frame: Option<usize>,
}

impl EpochGeometry {
    fn of_system(&self, system: GnssSystem) -> impl Iterator<Item = &TrackedSatellite> {
        self.satellites.iter().filter(move |sat| sat.system == system)
    }
}

/// Tightly-coupled GNSS model: satellite geometry, the local-to-ECEF
/// alignment and the residuals of the current epoch.
pub struct GnssModel {
    config: GnssConfig,
    lever_arm: Vector3<f64>,
    gate: InnovationGate,
    latch: ReadyLatch,
    transform: Option<LocalToEcef>,
    iono: Option<IonoParams>,
    window: AlignmentWindow,
    current: Option<EpochGeometry>,
    previous: Option<EpochGeometry>,
    receiver_guess: Vector3<f64>,
    preintegration: Option<ImuPreintegration>,
    /// An IMU gap broke the interval since the last frame.
    imu_gap: bool,
    frame: usize,
    last_frame: Option<FrameEstimate>,
}

impl GnssModel {
    pub fn new(config: GnssConfig) -> Self {
        let anchor = config.anchor;
        let mut model = Self {
            lever_arm: Vector3::from(config.lever_arm),
            gate: InnovationGate::new(config.gate),
            config,
            latch: ReadyLatch::default(),
            transform: None,
            iono: None,
            window: AlignmentWindow::default(),
            current: None,
            previous: None,
            receiver_guess: Vector3::zeros(),
            preintegration: None,
            imu_gap: false,
            frame: 0,
            last_frame: None,
        };
        if let Some(AnchorConfig { ecef, yaw }) = anchor {
            let anchor = Vector3::from(ecef);
            model.set_lidar_init(anchor, rotation_ecef_enu_at(&anchor), yaw);
        }
        model
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
    pub fn local_time(&self, gnss_time: f64) -> f64 {
        gnss_time - self.config.time_offset
    }

    pub fn set_iono(&mut self, params: IonoParams) {
        self.iono = Some(params);
    }

    /// Aligns the local frame from a known anchor, e.g. after relocalizing
    /// in a prior map.
    pub fn set_lidar_init(
        &mut self,
        anchor: Vector3<f64>,
        rotation_ecef_enu: nalgebra::Rotation3<f64>,
        yaw: f64,
    ) {
        self.become_ready(local_to_ecef(anchor, rotation_ecef_enu, yaw));
    }

    fn become_ready(&mut self, transform: LocalToEcef) {
        if self.latch.latch() {
            info!(
                "gnss ready, anchor {:?}",
                transform.translation.vector.as_slice()
            );
        }
        self.transform = Some(transform);
        self.window.clear();
    }

    /// Refreshes the satellite geometry of `epoch` at the predicted `state`.
    /// Returns how many satellites passed the elevation mask.
    pub fn process_gnss(&mut self, epoch: &GnssEpoch, state: &State) -> usize {
        let time = self.local_time(epoch.time);
        let antenna = antenna_position(state, &self.lever_arm);

        let receiver = match &self.transform {
            Some(transform) => Some(transform.transform_point(&Point3::from(antenna)).coords),
            None => {
                let raw: Vec<_> = epoch
                    .satellites
                    .iter()
                    .map(|sat| RangeObservation {
                        system: sat.system,
                        satellite: sat.position,
                        range: sat.pseudorange + sat.clock_bias,
                    })
                    .collect();
                spp::solve(&raw, &self.receiver_guess).map(|solution| solution.position)
            }
        };
        let Some(receiver) = receiver else {
            debug!("gnss epoch at {time:.3}: no receiver position, skipped");
            self.current = None;
            return 0;
        };

        let geodetic = ecef_to_geodetic(&receiver);
        let min_elevation = self.config.min_elevation_deg.to_radians();
        let satellites: Vec<_> = epoch
            .satellites
            .iter()
            .filter_map(|sat| {
                let (elevation, azimuth) = elevation_azimuth(&receiver, &sat.position);
                if elevation < min_elevation {
                    return None;
                }
                let iono = self.iono.as_ref().map_or(0.0, |params| {
                    klobuchar_delay(params, &geodetic, azimuth, elevation, epoch.time)
                });
                Some(TrackedSatellite {
                    system: sat.system,
                    prn: sat.prn,
                    position: sat.position,
                    range: sat.pseudorange + sat.clock_bias - iono,
                    phase: sat.carrier_phase.map(|phase| phase + sat.clock_bias + iono),
                    rate: sat.doppler,
                    clock_bias: sat.clock_bias,
                })
            })
            .collect();

        if !self.latch.is_ready() {
            let corrected: Vec<_> = satellites
                .iter()
                .map(TrackedSatellite::range_observation)
                .collect();
            if let Some(solution) = spp::solve(&corrected, &receiver) {
                self.receiver_guess = solution.position;
                self.window.push(antenna, solution.position);
            }
        }

        let kept = satellites.len();
        self.current = Some(EpochGeometry {
            time,
            satellites,
            antenna,
            frame: None,
        });
        kept
    }

    /// Decides what the processed epoch does to the filter.
    pub fn evaluate(&mut self, eskf: &Eskf<State>) -> GnssVerdict {
        if !self.latch.is_ready() {
            let Some(alignment) = self
                .window
                .solve(self.config.min_init_epochs, self.config.min_init_travel)
            else {
                return GnssVerdict::NotReady;
            };
            info!(
                "gnss aligned after {} epochs, yaw {:.4} rad",
                self.window.len(),
                alignment.yaw
            );
            self.become_ready(alignment.transform);
        }

        let (Some(transform), Some(epoch)) = (&self.transform, &self.current) else {
            return GnssVerdict::NoCorrection;
        };
        let measurements = self.measurements(transform, epoch);
        let clock_params = measurements.len();
        judge(
            eskf,
            measurements,
            clock_params,
            self.config.no_correction_tol,
            &self.gate,
        )
    }

    fn measurements(&self, transform: &LocalToEcef, epoch: &EpochGeometry) -> Vec<Factor> {
        let previous = self
            .previous
            .as_ref()
            .filter(|previous| epoch.time - previous.time <= self.config.max_phase_interval);

        let mut measurements = Vec::new();
        for system in GnssSystem::ALL {
            let factors: Vec<_> = epoch
                .of_system(system)
                .map(|sat| PseudorangeFactor {
                    system,
                    satellite: sat.position,
                    corrected_range: sat.range,
                    weight: 1.0,
                })
                .collect();
            if factors.len() >= 2 {
                measurements.push(Factor::GnssPseudorange(PseudorangeGroup {
                    transform: transform.clone(),
                    lever_arm: self.lever_arm,
                    factors,
                    variance: self.config.pseudorange_std.powi(2),
                }));
            }

            let Some(previous) = previous else {
                continue;
            };
            let factors: Vec<_> = phase_pairs(previous, epoch, system)
                .map(|(before, now, phase_diff)| CarrierPhaseDiffFactor {
                    system,
                    satellite_i: before.position,
                    satellite_j: now.position,
                    phase_diff,
                    weight: 1.0,
                })
                .collect();
            if factors.len() >= 2 {
                measurements.push(Factor::GnssPhase(PhaseDiffGroup {
                    transform: transform.clone(),
                    lever_arm: self.lever_arm,
                    previous_antenna: previous.antenna,
                    factors,
                    variance: 2.0 * self.config.phase_std.powi(2),
                }));
            }
        }
        measurements
    }

    /// Closes the current epoch at the posterior `state`: estimates the
    /// receiver clocks and keeps the geometry for the next phase difference.
    pub fn epoch_done(&mut self, state: &mut State) {
        let Some(mut epoch) = self.current.take() else {
            return;
        };
        epoch.antenna = antenna_position(state, &self.lever_arm);

        if let Some(transform) = &self.transform {
            let receiver = transform.transform_point(&Point3::from(epoch.antenna)).coords;
            state.clock.roll();
            for system in GnssSystem::ALL {
                let offsets: Vec<_> = epoch
                    .of_system(system)
                    .map(|sat| sat.range - (sat.position - receiver).norm())
                    .collect();
                if !offsets.is_empty() {
                    let count = offsets.len() as f64;
                    state.clock.set_offset(
                        system,
                        offsets.iter().sum::<f64>() / count,
                        self.config.pseudorange_std.powi(2) / count,
                    );
                }
            }
        }
        self.previous = Some(epoch);
    }

    /// Drops the current epoch without touching the phase reference.
    pub fn discard_epoch(&mut self) {
        self.current = None;
    }

    /// Accumulates an IMU sample towards the next back-end frame.
    pub fn integrate_imu(&mut self, dt: f64, acc: Vector3<f64>, gyr: Vector3<f64>, state: &State) {
        if !self.latch.is_ready() {
            return;
        }
        let Some(preintegration) = self.preintegration.as_mut() else {
            self.preintegration = Some(ImuPreintegration::new(
                acc,
                gyr,
                state.ba,
                state.bg,
                self.config.preintegration,
            ));
            return;
        };
        if dt > self.config.max_imu_gap {
            warn!("imu gap of {dt:.3} s, the next gnss frame has no inertial link");
            preintegration.reset();
            preintegration.set_acc0_gyr0(acc, gyr);
            self.imu_gap = true;
        } else {
            preintegration.push_back(dt, acc, gyr);
        }
    }

    /// Adds the current epoch as a new frame to `backend`, optimizes and
    /// returns the optimized frame. `Ok(None)` until the model is aligned.
    pub fn feed_backend(
        &mut self,
        backend: &mut dyn GraphBackend,
        state: &State,
    ) -> Result<Option<FrameEstimate>> {
        let (Some(transform), Some(epoch)) = (&self.transform, &mut self.current) else {
            return Ok(None);
        };
        let frame = self.frame;

        if frame == 0 {
            backend.add_variable(Key::Anchor, Variable::Point(transform.translation.vector));
            backend.add_variable(Key::Orientation, Variable::Rotation(transform.rotation));
        }

        let measured = FrameEstimate {
            rotation: state.rot,
            position: state.pos,
            velocity: state.vel,
        };
        let linked = !self.imu_gap;
        let initial = match (&self.preintegration, &self.last_frame) {
            (Some(preintegration), Some(last)) if linked => {
                preintegration.predict(last, &state.gravity)
            }
            _ => measured.clone(),
        };
        backend.add_variable(
            Key::Frame(frame),
            Variable::Frame {
                position: initial.position,
                velocity: initial.velocity,
            },
        );
        backend.add_variable(Key::FrameRotation(frame), Variable::Rotation(initial.rotation));
        backend.add_variable(Key::Clock(frame), Variable::Clock(state.clock.current));

        let pseudorange_weight = self.config.pseudorange_std.recip();
        for sat in &epoch.satellites {
            backend.add_factor(GraphFactor::Pseudorange {
                factor: PseudorangeFactor {
                    system: sat.system,
                    satellite: sat.position,
                    corrected_range: sat.range,
                    weight: pseudorange_weight,
                },
                frame,
            });
        }

        let phase_weight = (2.0_f64.sqrt() * self.config.phase_std).recip();
        let doppler_weight = self.config.doppler_std.recip();
        match (&self.previous, frame.checked_sub(1)) {
            (Some(previous), Some(previous_frame)) if previous.frame == Some(previous_frame) => {
                let interval = epoch.time - previous.time;
                for system in GnssSystem::ALL {
                    for (before, now, phase_diff) in phase_pairs(previous, epoch, system) {
                        backend.add_factor(GraphFactor::CarrierPhaseDiff {
                            factor: CarrierPhaseDiffFactor {
                                system,
                                satellite_i: before.position,
                                satellite_j: now.position,
                                phase_diff,
                                weight: phase_weight,
                            },
                            frame_i: previous_frame,
                            frame_j: frame,
                        });
                    }
                    for (before, now) in matched_pairs(previous, epoch, system) {
                        let Some(factor) = doppler_factor(before, now, interval, doppler_weight)
                        else {
                            continue;
                        };
                        backend.add_factor(GraphFactor::Doppler {
                            factor,
                            frame_i: previous_frame,
                            frame_j: frame,
                        });
                    }
                }
            }
            _ => backend.add_factor(GraphFactor::PosePrior {
                frame,
                pose: measured,
                information: self.config.prior_information,
            }),
        }

        // every frame starts a new interval, linked or not
        if let Some(preintegration) = self.preintegration.as_mut() {
            if let Some(previous_frame) = frame.checked_sub(1).filter(|_| linked) {
                backend.add_factor(GraphFactor::PreintegratedImu {
                    frame_i: previous_frame,
                    frame_j: frame,
                    preintegration: Box::new(preintegration.clone()),
                    gravity: state.gravity,
                });
            }
            preintegration.reset();
            preintegration.repropagate(state.ba, state.bg);
        }
        self.imu_gap = false;

        backend.optimize()?;
        epoch.frame = Some(frame);
        self.frame += 1;

        let estimate = frame_estimate(backend, frame)
            .ok_or_else(|| Error::Backend(format!("frame {frame} is missing from the estimate")))?;
        self.last_frame = Some(estimate.clone());
        Ok(Some(estimate))
    }
}

/// Satellites of `system` tracked in both epochs.
fn matched_pairs<'a>(
    previous: &'a EpochGeometry,
    current: &'a EpochGeometry,
    system: GnssSystem,
) -> impl Iterator<Item = (&'a TrackedSatellite, &'a TrackedSatellite)> {
    current.of_system(system).filter_map(move |now| {
        let before = previous
            .of_system(system)
            .find(|before| before.prn == now.prn)?;
        Some((before, now))
    })
}

/// Satellites tracked with phase in both epochs, with their phase change.
fn phase_pairs<'a>(
    previous: &'a EpochGeometry,
    current: &'a EpochGeometry,
    system: GnssSystem,
) -> impl Iterator<Item = (&'a TrackedSatellite, &'a TrackedSatellite, f64)> {
    matched_pairs(previous, current, system)
        .filter_map(|(before, now)| Some((before, now, now.phase? - before.phase?)))
}

/// Doppler of `now`, with the satellite velocity and clock drift taken from
/// the change since `before`.
fn doppler_factor(
    before: &TrackedSatellite,
    now: &TrackedSatellite,
    interval: f64,
    weight: f64,
) -> Option<DopplerFactor> {
    let rate = now.rate?;
    (interval > 0.0).then(|| DopplerFactor {
        system: now.system,
        satellite: now.position,
        satellite_velocity: (now.position - before.position) / interval,
        range_rate: rate + (now.clock_bias - before.clock_bias) / interval,
        interval,
        weight,
    })
}
