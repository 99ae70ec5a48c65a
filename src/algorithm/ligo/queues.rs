use std::collections::VecDeque;

use flume::{Receiver, Sender, TryRecvError};
use log::warn;

use crate::gnss::{GnssEpoch, IonoParams, NmeaFix};

use super::{
    config::SensorConfig,
    measurement::{ImuSample, LidarScan},
};

/// Anything a sensor driver can hand to the estimator.
#[derive(Debug, Clone)]
pub enum SensorMessage {
    Imu(ImuSample),
    Lidar(LidarScan),
    Gnss(GnssEpoch),
    Nmea(NmeaFix),
    Iono(IonoParams),
}

macro_rules! from_message {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for SensorMessage {
                #[inline]
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

from_message!(
    Imu(ImuSample),
    Lidar(LidarScan),
    Gnss(GnssEpoch),
    Nmea(NmeaFix),
    Iono(IonoParams),
);

/// Producer handle, cheap to clone into any driver thread.
#[derive(Debug, Clone)]
pub struct SensorSender(Sender<SensorMessage>);

impl SensorSender {
    /// Queues `message`, `false` once the estimator is gone.
    #[inline]
    pub fn send(&self, message: impl Into<SensorMessage>) -> bool {
        self.0.send(message.into()).is_ok()
    }
}

/// Time-ordered buffers filled from the producer channel.
///
/// Messages of a sensor switched off in [`SensorConfig`] are dropped on arrival.
#[derive(Debug)]
pub struct SensorQueues {
    receiver: Receiver<SensorMessage>,
    sender: Sender<SensorMessage>,
    sensors: SensorConfig,
    /// Sensors already warned about, indexed like [`SensorMessage::slot`].
    ignored: [bool; 4],
    pub imu: VecDeque<ImuSample>,
    pub lidar: VecDeque<LidarScan>,
    pub gnss: VecDeque<GnssEpoch>,
    pub nmea: VecDeque<NmeaFix>,
    pub iono: Option<IonoParams>,
    last_imu: f64,
    last_lidar: f64,
}

impl SensorMessage {
    fn slot(&self) -> (usize, &'static str) {
        match self {
            Self::Imu(_) => (0, "imu"),
            Self::Lidar(_) => (1, "lidar"),
            Self::Gnss(_) | Self::Iono(_) => (2, "gnss"),
            Self::Nmea(_) => (3, "nmea"),
        }
    }

    fn enabled(&self, sensors: &SensorConfig) -> bool {
        match self {
            Self::Imu(_) => sensors.imu,
            Self::Lidar(_) => sensors.lidar,
            Self::Gnss(_) | Self::Iono(_) => sensors.gnss,
            Self::Nmea(_) => sensors.nmea,
        }
    }
}

impl SensorQueues {
    pub fn new(sensors: SensorConfig) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            receiver,
            sender,
            sensors,
            ignored: [false; 4],
            imu: VecDeque::new(),
            lidar: VecDeque::new(),
            gnss: VecDeque::new(),
            nmea: VecDeque::new(),
            iono: None,
            last_imu: f64::NEG_INFINITY,
            last_lidar: f64::NEG_INFINITY,
        }
    }

    #[inline]
    pub fn sender(&self) -> SensorSender {
        SensorSender(self.sender.clone())
    }

    /// Moves everything pending in the channel into the buffers without
    /// blocking. Returns how many messages were taken.
    pub fn drain(&mut self) -> usize {
        let mut taken = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(message) => {
                    self.push(message);
                    taken += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return taken,
            }
        }
    }

    pub fn push(&mut self, message: SensorMessage) {
        if !message.enabled(&self.sensors) {
            let (slot, name) = message.slot();
            if !std::mem::replace(&mut self.ignored[slot], true) {
                warn!("{name} is disabled, its messages are ignored");
            }
            return;
        }
        match message {
            SensorMessage::Imu(sample) => {
                if sample.timestamp < self.last_imu {
                    warn!("imu loop back, clearing {} buffered samples", self.imu.len());
                    self.imu.clear();
                }
                self.last_imu = sample.timestamp;
                self.imu.push_back(sample);
            }
            SensorMessage::Lidar(scan) => {
                if scan.timestamp < self.last_lidar {
                    warn!("lidar loop back, clearing {} buffered scans", self.lidar.len());
                    self.lidar.clear();
                }
                self.last_lidar = scan.timestamp;
                self.lidar.push_back(scan);
            }
            SensorMessage::Gnss(epoch) => {
                if self.gnss.back().is_some_and(|last| epoch.time < last.time) {
                    warn!("gnss loop back, clearing {} buffered epochs", self.gnss.len());
                    self.gnss.clear();
                }
                self.gnss.push_back(epoch);
            }
            SensorMessage::Nmea(fix) => {
                if self.nmea.back().is_some_and(|last| fix.time < last.time) {
                    warn!("nmea loop back, clearing {} buffered fixes", self.nmea.len());
                    self.nmea.clear();
                }
                self.nmea.push_back(fix);
            }
            SensorMessage::Iono(params) => self.iono = Some(params),
        }
    }

    /// Time of the newest IMU sample received.
    #[inline]
    pub fn last_imu_time(&self) -> Option<f64> {
        self.last_imu.is_finite().then_some(self.last_imu)
    }
}
