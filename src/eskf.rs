//! Error‑State Kalman Filter.

use core::ops::{Deref, DerefMut, Sub};

use nalgebra::{DefaultAllocator, RealField, allocator::Allocator};
use num_traits::Zero;

mod covariance;
pub mod observe;
pub mod state;
pub use covariance::Covariance;
pub mod uncertain;

use state::KFState;

use uncertain::Uncertained;

/// The filter: a state with its covariance, the process noise, and the two
/// propagation clocks.
pub struct Eskf<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    uncertainty: Uncertained<S>,
    pub process_cov: Covariance<S>,
    pub last_update_time: KFTime<S::Element>,
}

/// A pair of clocks, one for the mean and one for the covariance.
///
/// ```text
///  mean ├────────────────────────┤ t_mean
///  cov  ├───────────────┤ t_cov
///                       ╰── catches up on the next covariance-rate event
/// ```
///
/// They are allowed to drift apart so that process noise is integrated
/// exactly once per interval even when the mean is advanced more often.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct KFTime<T> {
    pub mean: T,
    pub cov: T,
}

pub type DeltaTime<T> = KFTime<T>;

/// Which parts of the filter a propagation step advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagate {
    /// Move the mean only, the covariance was already advanced.
    Mean,
    /// Grow the uncertainty without moving the mean.
    Covariance,
    Both,
}

pub trait StatePredictor<T> {
    fn predict(&mut self, dt: T);
}

pub trait StateObserver<T> {
    type Outcome;
    fn observe(&mut self, measurement: T) -> Self::Outcome;
}

impl<S> Eskf<S>
where
    S: KFState<Element: RealField>,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    pub fn new_with_state(
        state: S,
        init_variance: S::Element,
        process_cov: Covariance<S>,
        timestamp_init: S::Element,
    ) -> Self {
        Self {
            uncertainty: Uncertained::new(state, init_variance),
            process_cov,
            last_update_time: KFTime::all(timestamp_init),
        }
    }

    /// Elapsed time on each clock up to `timestamp`, restricted to `target`.
    ///
    /// Clocks named by `target` move forward to `timestamp`, clocks that are
    /// already ahead stay put and report a zero interval.
    pub fn advance_clocks(
        &mut self,
        timestamp: S::Element,
        target: Propagate,
    ) -> DeltaTime<S::Element> {
        let zero = S::Element::zero();
        let mut dt = KFTime::all(timestamp.clone()) - self.last_update_time.clone();

        if target == Propagate::Covariance || dt.mean < zero {
            dt.mean = zero.clone();
        }
        if target == Propagate::Mean || dt.cov < zero {
            dt.cov = zero.clone();
        }
        if dt.mean > zero {
            self.last_update_time.mean = timestamp.clone();
        }
        if dt.cov > zero {
            self.last_update_time.cov = timestamp;
        }
        dt
    }

    /// Pins both clocks to `timestamp`, used after a re-initialization.
    pub fn reset_clocks(&mut self, timestamp: S::Element) {
        self.last_update_time = KFTime::all(timestamp);
    }
}

impl<S> Deref for Eskf<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    type Target = Uncertained<S>;

    fn deref(&self) -> &Self::Target {
        &self.uncertainty
    }
}

impl<S> DerefMut for Eskf<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.uncertainty
    }
}

impl<T: Clone> KFTime<T> {
    #[inline]
    pub fn all(t: T) -> Self {
        Self {
            mean: t.clone(),
            cov: t,
        }
    }
}

impl<T> Sub for KFTime<T>
where
    T: Sub<Output = T>,
{
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            mean: self.mean - rhs.mean,
            cov: self.cov - rhs.cov,
        }
    }
}
