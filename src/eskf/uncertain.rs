use std::ops::{Deref, DerefMut};

use nalgebra::{DefaultAllocator, OMatrix, RealField, allocator::Allocator};

use crate::eskf::{Covariance, state::KFState};

/// A state paired 1:1 with its covariance.
#[derive(Debug, Clone)]
pub struct Uncertained<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    pub state: S,
    /// The covariance matrix of the state.
    pub cov: Covariance<S>,
}

impl<S> Deref for Uncertained<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl<S> DerefMut for Uncertained<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

impl<S> Uncertained<S>
where
    S: KFState<Element: RealField>,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    /// A state with an isotropic prior of `variance` on every error-state axis.
    pub fn new(state: S, variance: S::Element) -> Self {
        Self::new_with_cov(state, OMatrix::from_diagonal_element(variance))
    }

    pub const fn new_with_cov(state: S, cov: OMatrix<S::Element, S::Dim, S::Dim>) -> Self {
        let cov = Covariance(cov);
        Self { state, cov }
    }

    /// Overwrites the mean and falls back to an isotropic prior.
    pub fn reset(&mut self, state: S, variance: S::Element) {
        self.state = state;
        self.cov = Covariance::from_diagonal_element(variance);
    }
}
