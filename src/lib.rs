#![deny(clippy::unwrap_used)]
#![deny(clippy::undocumented_unsafe_blocks)]
#![deny(unused_must_use)]
pub mod algorithm;
pub mod error;
pub mod eskf;
pub mod frame;
pub mod gnss;
pub mod ivox;
pub mod trajectory;
mod utils;

pub use algorithm::ligo::{
    Config, Estimator, Flow, Odometry, Relocalizer, SensorMessage, SensorSender, SpinOutcome,
    SystemStatus,
};
pub use error::{Error, Result};
