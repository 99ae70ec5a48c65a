use crate::eskf::state::{KFState, SubStateOf};
use std::ops::{Deref, DerefMut};

use nalgebra::{
    CStride, DefaultAllocator, DimName, MatrixView, MatrixViewMut, OMatrix, RStride, RealField,
    allocator::Allocator,
};
use num_traits::Zero;

type OwnedSquareMatrix<T, D> = OMatrix<T, D, D>;
type SquareMatrixViewMut<'a, T, R, C, DS> =
    MatrixViewMut<'a, T, R, C, RStride<T, DS, DS>, CStride<T, DS, DS>>;
type SquareMatrixView<'a, T, R, C, DS> =
    MatrixView<'a, T, R, C, RStride<T, DS, DS>, CStride<T, DS, DS>>;

/// A square matrix over the error state of `S`, addressed by typed sub-state blocks.
///
/// The same type holds the state covariance, the process noise and the
/// discrete transition matrix, since all three share the block layout.
///
/// # Sensitivity view
/// ```text
///             Src::Offset
///             ├── Src ──┤
/// ┬  ╭──────────────────────────╮
/// │  │                          │
/// Dst│         ┌─────────┐      │  d Dst
/// │  │         │  view   │      │  ─────
/// ┴  │         └─────────┘      │  d Src
///    │                          │
///    ╰──────────────────────────╯
/// ```
#[derive(Debug, Clone)]
pub struct Covariance<S>(pub OwnedSquareMatrix<S::Element, S::Dim>)
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>;

impl<S> Deref for Covariance<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    type Target = OwnedSquareMatrix<S::Element, S::Dim>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> DerefMut for Covariance<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<S> Covariance<S>
where
    S: KFState,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    /// The block mapping a change of `Src` to a change of `Dst`.
    #[inline]
    pub fn sensitivity_mut<Src, Dst>(
        &mut self,
    ) -> SquareMatrixViewMut<'_, S::Element, Dst::Dim, Src::Dim, S::Dim>
    where
        Src: SubStateOf<S> + ?Sized,
        Dst: SubStateOf<S> + ?Sized,
    {
        self.generic_view_mut(
            (Dst::Offset::DIM, Src::Offset::DIM),
            (Dst::Dim::name(), Src::Dim::name()),
        )
    }

    #[inline]
    pub fn sensitivity<Src, Dst>(
        &self,
    ) -> SquareMatrixView<'_, S::Element, Dst::Dim, Src::Dim, S::Dim>
    where
        Src: SubStateOf<S> + ?Sized,
        Dst: SubStateOf<S> + ?Sized,
    {
        self.generic_view(
            (Dst::Offset::DIM, Src::Offset::DIM),
            (Dst::Dim::name(), Src::Dim::name()),
        )
    }

    #[inline]
    pub fn sub_covariance<Sub>(
        &self,
    ) -> SquareMatrixView<'_, S::Element, Sub::Dim, Sub::Dim, S::Dim>
    where
        Sub: SubStateOf<S> + ?Sized,
    {
        self.sensitivity::<Sub, Sub>()
    }

    #[inline]
    pub fn sub_covariance_mut<Sub>(
        &mut self,
    ) -> SquareMatrixViewMut<'_, S::Element, Sub::Dim, Sub::Dim, S::Dim>
    where
        Sub: SubStateOf<S> + ?Sized,
    {
        self.sensitivity_mut::<Sub, Sub>()
    }
}

impl<S> Covariance<S>
where
    S: KFState<Element: RealField>,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    #[inline]
    pub fn from_diagonal_element(value: S::Element) -> Self {
        Self(OMatrix::from_diagonal_element(value))
    }

    #[inline]
    pub fn identity() -> Self {
        Self(OMatrix::identity())
    }

    /// Replaces the matrix with `(P + Pᵀ) / 2`.
    pub fn symmetrize(&mut self) {
        let half: S::Element = nalgebra::convert(0.5);
        let transposed = self.0.transpose();
        self.0 += transposed;
        self.0 *= half;
    }

    /// Largest absolute difference between the matrix and its transpose.
    pub fn asymmetry(&self) -> S::Element {
        (&self.0 - self.0.transpose()).amax()
    }
}

impl<S> Default for Covariance<S>
where
    S: KFState<Element: Zero>,
    DefaultAllocator: Allocator<S::Dim, S::Dim>,
{
    #[inline]
    fn default() -> Self {
        Self(OMatrix::zeros())
    }
}
