use nalgebra::{DefaultAllocator, DimName, DimNameSum, OVector, Scalar, allocator::Allocator};

pub trait KFState {
    type Element: Scalar;
    type Dim: DimName;
}

pub type StateDim<S> = <S as KFState>::Dim;

/// # Overview
/// ```text
/// ├────┬─ Superstate ─┬────┤
///      ├── Substate ──┤
///      │              │
///      Offset         EndOffset
/// ├────╯              │
/// ├───────────────────╯
/// ```
pub trait SubStateOf<Super: KFState>: KFState {
    type Offset: DimName;
}

/// The `Offset` of the `SubState` in the `Super`.
/// See also [`SubStateOf`].
pub type SubStateOffset<S, Super> = <S as SubStateOf<Super>>::Offset;

/// The `Offset` of the end of the `SubState` in the `Super`.
/// See also [`SubStateOf`].
pub type SubStateEndOffset<S, Super> = DimNameSum<<S as SubStateOf<Super>>::Offset, StateDim<S>>;

/// A state living on a manifold, with its error state in the tangent space.
///
/// `a.boxplus(&a.boxminus(b))` must give back `b` (up to rounding).
pub trait Manifold: KFState + Clone
where
    DefaultAllocator: Allocator<Self::Dim>,
{
    /// Moves the state along a tangent-space perturbation.
    fn boxplus(&mut self, delta: &OVector<Self::Element, Self::Dim>);

    /// Tangent-space difference `self ⊟ origin`.
    fn boxminus(&self, origin: &Self) -> OVector<Self::Element, Self::Dim>;
}
