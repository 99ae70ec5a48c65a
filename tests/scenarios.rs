use std::sync::atomic::AtomicBool;

use ligo::{
    Config, Error, Estimator, Relocalizer, SpinOutcome, SystemStatus,
    algorithm::ligo::measurement::{ImuSample, LidarScan, ScanPoint},
    gnss::{
        NmeaFix,
        geodesy::{Geodetic, geodetic_to_ecef, rotation_ecef_enu_at},
        local_to_ecef,
    },
    ivox::Ivox,
};
use nalgebra::{IsometryMatrix3, Point3, Vector3};

const IMU_RATE: f64 = 200.0;

/// Accelerometer in g, as the saturation limits expect.
fn imu(timestamp: f64, gyro: Vector3<f64>, acc_g: Vector3<f64>) -> ImuSample {
    ImuSample::new(timestamp, gyro, acc_g)
}

fn resting(timestamp: f64) -> ImuSample {
    imu(timestamp, Vector3::zeros(), Vector3::z())
}

/// A 12 m × 10 m room, the sensor starts 1 m above its floor.
fn room() -> Vec<Point3<f64>> {
    let step = 0.2;
    let mut points = Vec::new();
    for i in -30..=30 {
        for j in -25..=25 {
            let (x, y) = (i as f64 * step, j as f64 * step);
            points.push(Point3::new(x, y, -1.0));
            points.push(Point3::new(x, y, 3.0));
        }
    }
    for k in -4..=14 {
        let z = k as f64 * step;
        for i in -30..=30 {
            let x = i as f64 * step;
            points.push(Point3::new(x, -5.0, z));
            points.push(Point3::new(x, 5.0, z));
        }
        for j in -25..=25 {
            let y = j as f64 * step;
            points.push(Point3::new(-6.0, y, z));
            points.push(Point3::new(6.0, y, z));
        }
    }
    points
}

/// Scan of `room` starting at `timestamp`, points split over two time
/// offsets, seen from `position_at(t)`.
fn scan(
    timestamp: f64,
    room: &[Point3<f64>],
    position_at: impl Fn(f64) -> Vector3<f64>,
) -> LidarScan {
    let points = room
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let time_offset = if i % 2 == 0 { 0.0 } else { 0.05 };
            ScanPoint {
                position: Point3::from(point.coords - position_at(timestamp + time_offset)),
                intensity: 0.0,
                time_offset,
            }
        })
        .collect();
    LidarScan { timestamp, points }
}

fn spin_until_idle(estimator: &mut Estimator) -> Vec<SpinOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..1000 {
        match estimator.spin_once() {
            SpinOutcome::Idle => break,
            outcome => outcomes.push(outcome),
        }
    }
    outcomes
}

fn lidar_run(
    estimator: &mut Estimator,
    duration: f64,
    position_at: impl Fn(f64) -> Vector3<f64> + Copy,
) -> Vec<SpinOutcome> {
    let room = room();
    let sender = estimator.sender();
    let samples = (duration * IMU_RATE) as usize;
    for i in 0..=samples {
        sender.send(resting(i as f64 / IMU_RATE));
    }
    for i in 1..(duration * 10.0) as usize {
        sender.send(scan(i as f64 * 0.1, &room, position_at));
    }
    spin_until_idle(estimator)
}

#[test]
fn resting_imu_holds_position() {
    let mut config = Config::default();
    config.sensors.lidar = false;
    config.sensors.nmea = true;
    let mut estimator = Estimator::new(config).expect("config");

    let gyro_bias = Vector3::new(0.01, -0.02, 0.005);
    let sender = estimator.sender();
    for i in 0..=400 {
        sender.send(imu(i as f64 / IMU_RATE, gyro_bias, Vector3::z()));
    }
    let outcomes = spin_until_idle(&mut estimator);
    assert_eq!(outcomes.first(), Some(&SpinOutcome::Initialized));
    assert!(estimator.is_valid());

    let state = &estimator.context().eskf.state;
    assert!(state.pos.norm() < 1e-3, "drifted to {:?}", state.pos);
    assert!(state.vel.norm() < 1e-3);
    assert!((state.bg - gyro_bias).norm() < 1e-3);
    assert!(state.rot.angle() < 1e-3);

    let odometry = estimator.odometry().expect("running");
    assert!((odometry.timestamp - 2.0).abs() < 1e-9);
    assert!(!estimator.nmea().expect("nmea enabled").is_ready());
}

#[test]
fn static_room_keeps_the_sensor_still() {
    let mut estimator = Estimator::new(Config::default()).expect("config");
    let outcomes = lidar_run(&mut estimator, 1.0, |_| Vector3::zeros());

    assert_eq!(outcomes[0], SpinOutcome::Initialized);
    assert_eq!(
        outcomes[1],
        SpinOutcome::Processed {
            groups: 0,
            rejected: 0
        }
    );
    let updated = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, SpinOutcome::Processed { groups, rejected } if *groups > *rejected))
        .count();
    assert!(updated >= 5, "{outcomes:?}");

    let odometry = estimator.odometry().expect("running");
    assert!(odometry.pose.translation.vector.norm() < 0.05);
    assert!(odometry.velocity.norm() < 0.05);
    assert!(estimator.map_points().count() > 100);
    assert!(estimator.path().len() >= 5);
    assert!(
        estimator
            .path()
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp)
    );
}

#[test]
fn scans_reveal_constant_velocity() {
    let speed = 0.5;
    let truth = move |t: f64| Vector3::new(speed * t, 0.0, 0.0);
    let mut estimator = Estimator::new(Config::default()).expect("config");
    lidar_run(&mut estimator, 3.0, truth);

    // the map was seeded where the filter believed it was at the first scan
    let odometry = estimator.odometry().expect("running");
    let error = odometry.pose.translation.vector - truth(odometry.timestamp);
    assert!(error.norm() < 0.25, "position error {error:?}");
    assert!((odometry.velocity.x - speed).abs() < 0.25);
    assert!(odometry.velocity.yz().norm() < 0.1);
}

#[test]
fn nmea_aligns_after_travel_then_corrects() {
    let anchor = geodetic_to_ecef(&Geodetic {
        latitude: 0.52,
        longitude: 1.98,
        height: 30.0,
    });
    let local_to_earth = local_to_ecef(anchor, rotation_ecef_enu_at(&anchor), 0.4);
    // rest, 1 m/s² along x for two seconds, then cruise at 2 m/s
    let position = |t: f64| {
        let x = if t < 0.5 {
            0.0
        } else if t < 2.5 {
            0.5 * (t - 0.5).powi(2)
        } else {
            2.0 + 2.0 * (t - 2.5)
        };
        Vector3::new(x, 0.0, 0.0)
    };
    let acceleration = |t: f64| if (0.5..2.5).contains(&t) { 1.0 } else { 0.0 };

    let mut config = Config::default();
    config.sensors.lidar = false;
    config.sensors.nmea = true;
    let mut estimator = Estimator::new(config).expect("config");
    let sender = estimator.sender();
    for i in 0..=2000 {
        let t = i as f64 / IMU_RATE;
        let acc = Vector3::new(acceleration(t) / 9.81, 0.0, 1.0);
        sender.send(imu(t, Vector3::zeros(), acc));
    }
    for second in 1..=10 {
        let t = second as f64;
        sender.send(NmeaFix {
            time: t,
            position: local_to_earth
                .transform_point(&Point3::from(position(t)))
                .coords,
            velocity: None,
            covariance: None,
        });
    }
    spin_until_idle(&mut estimator);

    let nmea = estimator.nmea().expect("nmea enabled");
    assert!(nmea.is_ready());
    assert!(nmea.transform().is_some());

    let odometry = estimator.odometry().expect("running");
    let error = odometry.pose.translation.vector - position(odometry.timestamp);
    assert!(error.norm() < 0.5, "position error {error:?}");
}

struct SecondTry {
    attempts: usize,
}

impl Relocalizer for SecondTry {
    fn relocalize(
        &mut self,
        scan: &[Point3<f64>],
        map: &Ivox<f64>,
    ) -> Option<IsometryMatrix3<f64>> {
        assert!(!scan.is_empty());
        assert!(!map.is_empty());
        self.attempts += 1;
        (self.attempts > 1).then(IsometryMatrix3::identity)
    }
}

#[test]
fn prior_map_waits_for_relocalization() {
    let mut config = Config::default();
    config.map.prior_map = true;
    let mut estimator = Estimator::new(config)
        .expect("config")
        .with_relocalizer(Box::new(SecondTry { attempts: 0 }));
    let prior = estimator.load_prior_map(room()).expect("prior map");
    assert!(prior > 100);

    let outcomes = lidar_run(&mut estimator, 1.0, |_| Vector3::zeros());
    assert_eq!(
        &outcomes[..3],
        &[
            SpinOutcome::Initialized,
            SpinOutcome::Skipped,
            SpinOutcome::Initialized
        ]
    );
    assert_eq!(estimator.status(), SystemStatus::Running);
    // every later scan is matched against the prior map right away
    assert!(
        outcomes[3..]
            .iter()
            .all(|outcome| matches!(outcome, SpinOutcome::Processed { groups, .. } if *groups > 0))
    );
    let odometry = estimator.odometry().expect("running");
    assert!(odometry.pose.translation.vector.norm() < 0.05);
}

#[test]
fn prior_map_needs_the_switch() {
    let mut estimator = Estimator::new(Config::default()).expect("config");
    assert!(estimator.load_prior_map(room()).is_err());
}

#[test]
fn prior_map_mode_without_a_map_refuses_to_run() {
    let mut config = Config::default();
    config.map.prior_map = true;
    let mut estimator = Estimator::new(config).expect("config");
    let shutdown = AtomicBool::new(true);
    assert!(matches!(
        estimator.run(&shutdown, 100.0),
        Err(Error::PriorMapMissing)
    ));
}

#[test]
fn contradictory_sensors_are_refused() {
    let mut config = Config::default();
    config.sensors.gnss = true;
    config.sensors.nmea = true;
    assert!(Estimator::new(config).is_err());

    let mut config = Config::default();
    config.sensors.lidar = false;
    assert!(Estimator::new(config).is_err());
}
