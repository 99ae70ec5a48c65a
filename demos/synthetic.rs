//! Drives the estimator with a simulated platform crossing a walled yard.
//!
//! ```sh
//! RUST_LOG=info cargo run --example synthetic -- [config.toml]
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use ligo::{
    Config, Estimator,
    algorithm::ligo::measurement::{ImuSample, LidarScan, ScanPoint},
};
use nalgebra::{Point3, Vector3};
use rand::Rng;

const IMU_RATE: f64 = 200.0;
const SCAN_RATE: f64 = 10.0;
const DURATION: f64 = 10.0;
const SPEED: f64 = 1.0;
const RANGE: f64 = 15.0;

/// Floor plus four walls, sampled every 0.25 m.
fn yard() -> Vec<Point3<f64>> {
    let step = 0.25;
    let mut points = Vec::new();
    for i in -80..=80 {
        for j in -40..=40 {
            points.push(Point3::new(i as f64 * step, j as f64 * step, 0.0));
        }
        for k in 0..=16 {
            let (x, z) = (i as f64 * step, k as f64 * step);
            points.push(Point3::new(x, -10.0, z));
            points.push(Point3::new(x, 10.0, z));
        }
    }
    for j in -40..=40 {
        for k in 0..=16 {
            let (y, z) = (j as f64 * step, k as f64 * step);
            points.push(Point3::new(-20.0, y, z));
            points.push(Point3::new(20.0, y, z));
        }
    }
    points
}

fn position_at(t: f64) -> Vector3<f64> {
    Vector3::new(-10.0 + SPEED * t, 0.0, 1.0)
}

fn scan_at(t: f64, yard: &[Point3<f64>], rng: &mut impl Rng) -> LidarScan {
    let sensor = position_at(t);
    let points = yard
        .iter()
        .filter(|point| (point.coords - sensor).norm() < RANGE)
        .filter_map(|point| {
            if !rng.random_bool(0.3) {
                return None;
            }
            let noise = Vector3::from_fn(|_, _| rng.random_range(-0.01..0.01));
            let time_offset = rng.random_range(0..10) as f64 * 0.01;
            let sensor = position_at(t + time_offset);
            Some(ScanPoint {
                position: Point3::from(point.coords - sensor + noise),
                intensity: 0.0,
                time_offset,
            })
        })
        .collect();
    LidarScan {
        timestamp: t,
        points,
    }
}

fn main() -> ligo::Result<()> {
    pretty_env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    let mut estimator = Estimator::new(config)?;
    let sender = estimator.sender();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed)) {
            log::warn!("no ctrl-c handler: {err}");
        }
    }

    let producer = {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            let yard = yard();
            let mut rng = rand::rng();
            let steps = (DURATION * IMU_RATE) as usize;
            let per_scan = (IMU_RATE / SCAN_RATE) as usize;
            for step in 0..=steps {
                let t = step as f64 / IMU_RATE;
                let gyro = Vector3::from_fn(|_, _| rng.random_range(-0.002..0.002));
                // accelerometer in g
                let acc = Vector3::new(0.0, 0.0, 1.0)
                    + Vector3::from_fn(|_, _| rng.random_range(-0.002..0.002));
                sender.send(ImuSample::new(t, gyro, acc));
                // a scan is released once the IMU covers its end
                if step >= per_scan && step % per_scan == 0 {
                    let start = t - 1.0 / SCAN_RATE;
                    sender.send(scan_at(start, &yard, &mut rng));
                }
                thread::sleep(Duration::from_secs_f64(1.0 / IMU_RATE));
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            shutdown.store(true, Ordering::Relaxed);
        })
    };

    let stopped = estimator.run(&shutdown, 100.0);
    shutdown.store(true, Ordering::Relaxed);
    if producer.join().is_err() {
        log::error!("producer thread panicked");
    }
    stopped?;
    // whatever arrived after the last spin
    while estimator.spin_once() != ligo::SpinOutcome::Idle {}

    match estimator.odometry() {
        Some(odometry) => log::info!(
            "final position {:?}, truth {:?}, {} map points",
            odometry.pose.translation.vector.as_slice(),
            position_at(odometry.timestamp).as_slice(),
            estimator.map_points().count()
        ),
        None => log::warn!("the estimator never initialized"),
    }
    Ok(())
}
