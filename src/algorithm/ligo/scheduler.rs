use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use nalgebra::{IsometryMatrix3, Translation3, Vector3};

use crate::{
    error::{Error, Result},
    eskf::{Propagate, observe::UpdateOutcome},
    gnss::{GnssEpoch, GnssVerdict, NmeaFix},
};

use super::{
    Estimator, EstimatorContext, SystemStatus,
    measurement::{
        Factor, ImuInit, ImuMeasurement, ImuSample, LidarScan, PlaneMatcher, points,
    },
    predict::Prediction,
    queues::SensorQueues,
    state::State,
};

/// What one turn of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinOutcome {
    /// Waiting for data.
    Idle,
    Initialized,
    Processed { groups: usize, rejected: usize },
    /// A package was consumed without touching the state.
    Skipped,
}

/// Whether the rest of a GNSS/NMEA batch is still processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Gnss,
    Nmea,
    Imu,
}

impl Estimator {
    /// Processes one synchronized package.
    pub fn spin_once(&mut self) -> SpinOutcome {
        self.queues.drain();
        match self.context.status {
            SystemStatus::WaitingForData => self.initialize(),
            SystemStatus::Relocalizing => self.relocalize(),
            SystemStatus::Running if self.context.config.sensors.lidar => self.process_scan(),
            SystemStatus::Running => self.process_imu_only(),
        }
    }

    /// Spins at `rate` Hz until `shutdown` is raised, sleeping while idle.
    ///
    /// Fails up front when prior-map mode is on and no map was loaded.
    pub fn run(&mut self, shutdown: &AtomicBool, rate: f64) -> Result<()> {
        if self.context.config.map.prior_map && self.context.window.map().is_empty() {
            return Err(Error::PriorMapMissing);
        }
        let period = Duration::from_secs_f64(rate.max(1e-3).recip());
        while !shutdown.load(Ordering::Relaxed) {
            let start = Instant::now();
            if self.spin_once() == SpinOutcome::Idle {
                if let Some(rest) = period.checked_sub(start.elapsed()) {
                    std::thread::sleep(rest);
                }
            }
        }
        info!("estimator stopped, {} poses published", self.path().len());
        Ok(())
    }

    /// Handles every IMU, GNSS and NMEA event up to `timestamp`, earliest
    /// first. Returns how many events were handled.
    pub fn advance_to(&mut self, timestamp: f64) -> usize {
        let Self { context, queues } = self;
        if let (Some(params), Some(gnss)) = (queues.iono.take(), context.gnss.as_mut()) {
            gnss.set_iono(params);
        }

        let mut handled = 0;
        while let Some(source) = context.next_source(queues, timestamp) {
            handled += 1;
            let flow = match source {
                Source::Imu => {
                    if let Some(sample) = queues.imu.pop_front() {
                        context.handle_imu(&sample);
                    }
                    Flow::Continue
                }
                Source::Gnss => match queues.gnss.pop_front() {
                    Some(epoch) => context.handle_gnss(&epoch),
                    None => Flow::Continue,
                },
                Source::Nmea => match queues.nmea.pop_front() {
                    Some(fix) => context.handle_nmea(&fix),
                    None => Flow::Continue,
                },
            };
            if flow == Flow::Reset {
                context.drop_batch(queues, source, timestamp);
            }
        }
        handled
    }

    fn initialize(&mut self) -> SpinOutcome {
        let Self { context, queues } = self;
        let outcome = if context.config.sensors.imu {
            context.initialize_from_imu(queues)
        } else {
            context.initialize_from_scan(queues)
        };
        if outcome == SpinOutcome::Initialized {
            context.status = if context.relocalizer.is_some() && !context.window.map().is_empty() {
                SystemStatus::Relocalizing
            } else {
                SystemStatus::Running
            };
            // scans that ended before the initial state carry nothing new
            let start = context.eskf.last_update_time.mean;
            queues.lidar.retain(|scan| scan.end_time() >= start);
            info!(
                "initialized at {start:.3}, position {:?}",
                context.eskf.state.pos.as_slice()
            );
        }
        outcome
    }

    fn relocalize(&mut self) -> SpinOutcome {
        let Some(scan) = self.queues.lidar.pop_front() else {
            return SpinOutcome::Idle;
        };
        let context = &mut self.context;
        let (kept, _) =
            context
                .downsampler
                .preprocess(scan.timestamp, &scan.points, &context.config.lidar);
        let imu_points: Vec<_> = points::to_imu(&kept, &context.extrinsic)
            .map(|point| point.into_inner())
            .collect();

        let Some(relocalizer) = context.relocalizer.as_mut() else {
            context.status = SystemStatus::Running;
            return SpinOutcome::Skipped;
        };
        match relocalizer.relocalize(&imu_points, context.window.map()) {
            Some(pose) => {
                let state = &mut context.eskf.state;
                state.rot = pose.rotation;
                state.pos = pose.translation.vector;
                state.acc = -(state.rot.inverse() * state.gravity);
                context.status = SystemStatus::Running;
                info!("relocalized at {:?}", state.pos.as_slice());
                SpinOutcome::Initialized
            }
            None => {
                warn!(
                    "relocalization failed on the scan at {:.3}, waiting for the next one",
                    scan.timestamp
                );
                SpinOutcome::Skipped
            }
        }
    }

    fn process_scan(&mut self) -> SpinOutcome {
        let Some(end) = self.queues.lidar.front().map(LidarScan::end_time) else {
            return SpinOutcome::Idle;
        };
        if self.context.config.sensors.imu
            && self.queues.last_imu_time().is_none_or(|last| last < end)
        {
            return SpinOutcome::Idle;
        }
        let Some(scan) = self.queues.lidar.pop_front() else {
            return SpinOutcome::Idle;
        };
        if end < self.context.eskf.last_update_time.mean {
            warn!("scan at {:.3} is older than the state, dropped", scan.timestamp);
            return SpinOutcome::Skipped;
        }

        let context = &mut self.context;
        let (kept, groups) =
            context
                .downsampler
                .preprocess(scan.timestamp, &scan.points, &context.config.lidar);
        if kept.is_empty() {
            debug!("scan at {:.3} has no points left after filtering", scan.timestamp);
            self.advance_to(end);
            self.context.propagate(end, Propagate::Both);
            return SpinOutcome::Skipped;
        }

        if self.context.window.map().is_empty() {
            self.advance_to(end);
            let context = &mut self.context;
            context.propagate(end, Propagate::Both);
            let inserted = context.window.insert(points::to_world(
                &kept,
                &context.extrinsic,
                &context.eskf.state,
            ));
            info!("map started with {inserted} points");
            context.publish();
            return SpinOutcome::Processed {
                groups: 0,
                rejected: 0,
            };
        }

        let mut rejected = 0;
        for group in &groups {
            self.advance_to(group.timestamp);
            if !self.context.update_group(group.timestamp, &kept[group.range.clone()]) {
                rejected += 1;
            }
        }
        self.advance_to(end);
        self.context.publish();
        debug!(
            "scan at {:.3}: {} groups, {rejected} rejected, map {} points",
            scan.timestamp,
            groups.len(),
            self.context.window.map().len()
        );
        SpinOutcome::Processed {
            groups: groups.len(),
            rejected,
        }
    }

    /// Without LiDAR the IMU stream paces the loop.
    fn process_imu_only(&mut self) -> SpinOutcome {
        let Some(last) = self.queues.last_imu_time() else {
            return SpinOutcome::Idle;
        };
        if self.queues.imu.is_empty() && self.queues.gnss.is_empty() && self.queues.nmea.is_empty()
        {
            return SpinOutcome::Idle;
        }
        let handled = self.advance_to(last);
        self.context.publish();
        if handled == 0 {
            SpinOutcome::Idle
        } else {
            SpinOutcome::Processed {
                groups: 0,
                rejected: 0,
            }
        }
    }
}

impl EstimatorContext {
    /// The earliest pending event not later than `timestamp`. GNSS and NMEA
    /// win ties against the IMU.
    fn next_source(&self, queues: &SensorQueues, timestamp: f64) -> Option<Source> {
        let gnss = self
            .gnss
            .as_ref()
            .zip(queues.gnss.front())
            .map(|(model, epoch)| (model.local_time(epoch.time), Source::Gnss));
        let nmea = self
            .nmea
            .as_ref()
            .zip(queues.nmea.front())
            .map(|(model, fix)| (model.local_time(fix.time), Source::Nmea));
        let imu = queues
            .imu
            .front()
            .map(|sample| (sample.timestamp, Source::Imu));

        [gnss, nmea, imu]
            .into_iter()
            .flatten()
            .filter(|(time, _)| *time <= timestamp)
            // stable: on equal times the earlier entry is kept
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, source)| source)
    }

    /// Drops the GNSS or NMEA entries left in the batch up to `timestamp`.
    fn drop_batch(&self, queues: &mut SensorQueues, source: Source, timestamp: f64) {
        let dropped = match (source, &self.gnss, &self.nmea) {
            (Source::Gnss, Some(model), _) => {
                let before = queues.gnss.len();
                queues
                    .gnss
                    .retain(|epoch| model.local_time(epoch.time) > timestamp);
                before - queues.gnss.len()
            }
            (Source::Nmea, _, Some(model)) => {
                let before = queues.nmea.len();
                queues.nmea.retain(|fix| model.local_time(fix.time) > timestamp);
                before - queues.nmea.len()
            }
            _ => 0,
        };
        if dropped > 0 {
            warn!("rejected {source:?} measurement, {dropped} more dropped from the batch");
        }
    }

    fn propagate(&mut self, timestamp: f64, target: Propagate) {
        let input = self.propagation_input();
        self.eskf.propagate_to(timestamp, &input, target);
    }

    fn initialize_from_imu(&mut self, queues: &mut SensorQueues) -> SpinOutcome {
        let needed = self.config.imu.init_samples.max(1);
        if queues.imu.len() < needed {
            return SpinOutcome::Idle;
        }
        let samples: Vec<_> = queues.imu.drain(..needed).collect();
        let Some(init) = samples.iter().collect::<Option<ImuInit>>() else {
            return SpinOutcome::Idle;
        };

        let gravity = self.config.imu.gravity();
        let acc_norm = self.config.imu.acc_norm.unwrap_or_else(|| init.acc_norm());
        if acc_norm <= f64::EPSILON {
            warn!("accelerometer reads zero while resting, initialization retried");
            return SpinOutcome::Skipped;
        }
        self.acc_scale = gravity.norm() / acc_norm;

        let pose = self.config.map.init_pose().unwrap_or_else(|| {
            IsometryMatrix3::from_parts(Translation3::identity(), init.gravity_alignment())
        });
        let mut state = State::at_rest(&pose, &gravity);
        state.bg = init.gyro_mean;
        self.reset_filter(state, init.timestamp);
        self.last_imu = samples.last().cloned();
        info!(
            "imu initialized from {} samples, acc scale {:.4}",
            init.count, self.acc_scale
        );
        SpinOutcome::Initialized
    }

    fn initialize_from_scan(&mut self, queues: &SensorQueues) -> SpinOutcome {
        let Some(scan) = queues.lidar.front() else {
            return SpinOutcome::Idle;
        };
        let pose = self.config.map.init_pose().unwrap_or_else(IsometryMatrix3::identity);
        let state = State::at_rest(&pose, &self.config.imu.gravity());
        self.reset_filter(state, scan.timestamp);
        SpinOutcome::Initialized
    }

    fn reset_filter(&mut self, mut state: State, timestamp: f64) {
        state.clock.process_noise = self.config.filter.clock_process_noise;
        self.eskf.reset(state, self.config.filter.init_cov);
        self.eskf.reset_clocks(timestamp);
    }

    fn handle_imu(&mut self, sample: &ImuSample) {
        let t = sample.timestamp;
        let previous = self.eskf.last_update_time.mean;
        if t < previous {
            debug!("imu sample at {t:.4} is older than the state, dropped");
            return;
        }

        // zero-order hold of the previous reading over the interval
        let input = self.propagation_input();
        self.eskf.propagate_to(t, &input, Propagate::Both);

        let imu = &self.config.imu;
        if !imu.imu_as_input {
            let measurement = ImuMeasurement::new(
                sample,
                self.acc_scale,
                imu.satu_gyro,
                imu.satu_acc,
                imu.gyro_noise,
                imu.acc_noise,
            );
            let outcome = self.eskf.update(
                Prediction::none(),
                &self.config.filter.iteration(),
                |_| Ok(vec![Factor::from(measurement)]),
            );
            if let UpdateOutcome::Rejected(reason) = outcome {
                debug!("imu update at {t:.4} rejected: {reason:?}");
            }
        }

        if let Some(gnss) = self.gnss.as_mut() {
            gnss.integrate_imu(
                t - previous,
                sample.linear_acceleration * self.acc_scale,
                sample.angular_velocity,
                &self.eskf.state,
            );
        }
        self.last_imu = Some(sample.clone());
    }

    fn handle_gnss(&mut self, epoch: &GnssEpoch) -> Flow {
        let input = self.propagation_input();
        let Some(model) = self.gnss.as_mut() else {
            return Flow::Continue;
        };
        let t = model.local_time(epoch.time);
        if t < self.eskf.last_update_time.mean {
            debug!("gnss epoch at {t:.3} is older than the state, dropped");
            return Flow::Continue;
        }
        self.eskf.propagate_to(t, &input, Propagate::Both);

        let visible = model.process_gnss(epoch, &self.eskf.state);
        debug!("gnss epoch at {t:.3}: {visible} satellites above the mask");
        let measurements = match model.evaluate(&self.eskf) {
            GnssVerdict::NotReady | GnssVerdict::NoCorrection => {
                model.epoch_done(&mut self.eskf.state);
                return Flow::Continue;
            }
            GnssVerdict::Rejected => {
                model.discard_epoch();
                return Flow::Reset;
            }
            GnssVerdict::Correct(measurements) => measurements,
        };

        let before = self.eskf.state.pos;
        let outcome = self.eskf.update(
            Prediction::none(),
            &self.config.filter.iteration(),
            |_| Ok(measurements),
        );
        if !outcome.is_applied() {
            warn!("gnss update at {t:.3} not applied: {outcome:?}");
            model.discard_epoch();
            return Flow::Continue;
        }

        if let Some(backend) = self.backend.as_deref_mut() {
            match model.feed_backend(backend, &self.eskf.state) {
                // back-end frames live in the local frame, so does gravity
                Ok(Some(frame)) if !self.config.sensors.lidar => {
                    let state = &mut self.eskf.state;
                    state.rot = frame.rotation;
                    state.pos = frame.position;
                    state.vel = frame.velocity;
                    state.bg.fill(0.0);
                    state.ba.fill(0.0);
                    state.omg.fill(0.0);
                    state.acc = -(frame.rotation.inverse() * state.gravity);
                    let init_cov = self.config.filter.init_cov;
                    let state = self.eskf.state.clone();
                    self.eskf.reset(state, init_cov);
                }
                Ok(_) => {}
                Err(err) => error!("gnss back end failed at {t:.3}: {err}"),
            }
        }
        model.epoch_done(&mut self.eskf.state);
        self.on_correction(t, &before);
        Flow::Continue
    }

    fn handle_nmea(&mut self, fix: &NmeaFix) -> Flow {
        let input = self.propagation_input();
        let Some(model) = self.nmea.as_mut() else {
            return Flow::Continue;
        };
        let t = model.local_time(fix.time);
        if t < self.eskf.last_update_time.mean {
            debug!("nmea fix at {t:.3} is older than the state, dropped");
            return Flow::Continue;
        }
        self.eskf.propagate_to(t, &input, Propagate::Both);

        model.process_nmea(fix, &self.eskf.state);
        let measurements = match model.evaluate(&self.eskf) {
            GnssVerdict::NotReady | GnssVerdict::NoCorrection => {
                model.epoch_done();
                return Flow::Continue;
            }
            GnssVerdict::Rejected => {
                model.epoch_done();
                return Flow::Reset;
            }
            GnssVerdict::Correct(measurements) => measurements,
        };
        model.epoch_done();

        let before = self.eskf.state.pos;
        let outcome = self.eskf.update(
            Prediction::none(),
            &self.config.filter.iteration(),
            |_| Ok(measurements),
        );
        if outcome.is_applied() {
            self.on_correction(t, &before);
        } else {
            warn!("nmea update at {t:.3} not applied: {outcome:?}");
        }
        Flow::Continue
    }

    /// Lets the mapping window react to an applied GNSS/NMEA update.
    fn on_correction(&mut self, timestamp: f64, before: &Vector3<f64>) {
        if !self.config.sensors.lidar {
            return;
        }
        let corrected = self.eskf.state.pose();
        let replay = self.window.on_correction(timestamp, before, &corrected);
        debug!("correction at {timestamp:.3}: {replay:?}");
    }

    /// Corrects the state against the map at one point group, then grows the
    /// map. Returns whether the update was applied.
    fn update_group(&mut self, timestamp: f64, group: &[points::ScanPoint]) -> bool {
        let target = if self.config.imu.cov_at_imu_rate && self.config.sensors.imu {
            Propagate::Mean
        } else {
            Propagate::Both
        };
        self.propagate(timestamp, target);

        let Self {
            config,
            eskf,
            window,
            extrinsic,
            ..
        } = self;
        let matcher = PlaneMatcher::new(window.map(), &config.lidar);
        let outcome = eskf.update(Prediction::none(), &config.filter.iteration(), |eskf| {
            let found = matcher.correspondences(group, extrinsic, &eskf.state)?;
            Ok(found.into_iter().map(Factor::from).collect())
        });

        let world: Vec<_> = points::to_world(group, extrinsic, &eskf.state).collect();
        window.insert(world);
        if config.sensors.gnss || config.sensors.nmea {
            let state = &eskf.state;
            window.add_key_pose(
                state.rot,
                state.pos,
                points::to_imu(group, extrinsic).collect(),
                timestamp,
            );
        }
        outcome.is_applied()
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point3, Rotation3};

    use super::*;
    use crate::{
        eskf::Covariance,
        gnss::{
            AnchorConfig, GnssSystem, SatelliteObservation,
            backend::tests::RecordingBackend,
            geodesy::{Geodetic, geodetic_to_ecef, rotation_ecef_enu_at},
            local_to_ecef,
            preintegration::FrameEstimate,
            spp::tests::sky,
        },
    };

    #[test]
    fn test_gnss_only_adopts_the_backend_frame() {
        let anchor = geodetic_to_ecef(&Geodetic {
            latitude: 0.52,
            longitude: 1.98,
            height: 30.0,
        });
        let truth = local_to_ecef(anchor, rotation_ecef_enu_at(&anchor), 0.4);
        let mut config = crate::Config::default();
        config.sensors.lidar = false;
        config.sensors.gnss = true;
        config.gnss.anchor = Some(AnchorConfig {
            ecef: [anchor.x, anchor.y, anchor.z],
            yaw: 0.4,
        });
        let init_cov = config.filter.init_cov;

        let optimized = FrameEstimate {
            rotation: Rotation3::from_axis_angle(&Vector3::z_axis(), 0.2),
            position: Vector3::new(2.9, 0.1, 0.0),
            velocity: Vector3::new(0.4, 0.0, 0.0),
        };
        let mut context = EstimatorContext::new(config);
        context.backend = Some(Box::new(RecordingBackend {
            optimized: Some(optimized.clone()),
            ..Default::default()
        }));
        context.eskf.state.omg = Vector3::new(0.3, 0.0, 0.0);

        // the receiver is 3 m ahead of the state
        let receiver = truth
            .transform_point(&Point3::new(3.0, 0.0, 0.0))
            .coords;
        let epoch = GnssEpoch {
            time: 0.5,
            satellites: sky(&anchor)
                .into_iter()
                .enumerate()
                .map(|(i, position)| SatelliteObservation {
                    system: GnssSystem::Gps,
                    prn: i as u16 + 1,
                    pseudorange: (position - receiver).norm() + 10.0,
                    carrier_phase: None,
                    doppler: None,
                    position,
                    clock_bias: 0.0,
                })
                .collect(),
        };
        assert_eq!(context.handle_gnss(&epoch), Flow::Continue);

        let state = &context.eskf.state;
        assert_eq!(state.rot, optimized.rotation);
        assert_eq!(state.pos, optimized.position);
        assert_eq!(state.vel, optimized.velocity);
        assert_eq!(state.omg, Vector3::zeros());
        assert_eq!(state.bg, Vector3::zeros());
        assert_eq!(state.acc, -(optimized.rotation.inverse() * state.gravity));
        assert_eq!(*context.eskf.cov, *Covariance::<State>::from_diagonal_element(init_cov));
    }
}
