mod macros;
use nalgebra::{
    Cholesky, ClosedAddAssign, ComplexField, DefaultAllocator, Dim, DimAdd, DimMin, DimMinimum,
    DimSum, Matrix, Matrix3, OMatrix, RawStorageMut, Scalar, Storage, U1, Vector, Vector3,
    VectorViewMut, ViewStorageMut, allocator::Allocator,
};
use num_traits::Zero;
use std::{iter::Sum, ops::AddAssign};

pub trait ViewDiagonalMut {
    type Element;
    type Dim: Dim;
    type RStride: Dim;
    fn view_diagonal_mut(
        &mut self,
    ) -> VectorViewMut<'_, Self::Element, Self::Dim, Self::RStride, U1>;

    /// Adds `value` onto the main diagonal, e.g. measurement noise onto an innovation covariance.
    #[inline]
    fn diagonal_add<S>(mut self, value: &Vector<Self::Element, Self::Dim, S>) -> Self
    where
        Self: Sized,
        Self::Element: Scalar + ClosedAddAssign,
        S: Storage<Self::Element, Self::Dim>,
    {
        self.view_diagonal_mut().add_assign(value);
        self
    }
}

impl<T, R, C> ViewDiagonalMut for OMatrix<T, R, C>
where
    T: Scalar,
    R: Dim + DimMin<C> + DimAdd<U1>,
    C: Dim,
    DefaultAllocator: Allocator<R, C>,
{
    type Element = T;
    type Dim = DimMinimum<R, C>;
    type RStride = DimSum<R, U1>;
    #[inline]
    fn view_diagonal_mut(
        &mut self,
    ) -> VectorViewMut<'_, Self::Element, Self::Dim, Self::RStride, U1> {
        let (rows, cols) = self.shape_generic();
        let min_dim = rows.min(cols);
        // # SAFETY:
        //
        // Owned storage is contiguous and column-major, so stepping `rows + 1`
        // elements from the first one visits exactly the `min_dim` diagonal entries.
        unsafe {
            let data = ViewStorageMut::from_raw_parts(
                self.data.ptr_mut(),
                (min_dim, U1),
                (rows.add(U1), U1),
            );
            Matrix::from_data_statically_unchecked(data)
        }
    }
}

/// A type that can provides a positive definite substitute value
/// for some inverse operations like [`Cholesky::new_with_substitute`]
///
/// # SAFETY
///
/// the value of [`Substitutive::substitute`] must return a positive definite value
pub unsafe trait Substitutive: ComplexField {
    fn substitute() -> Self;
}

/// # SAFETY:
///
/// returned value is positive definite
unsafe impl<T: ComplexField> Substitutive for T {
    #[inline]
    fn substitute() -> Self {
        nalgebra::convert(0.0001)
    }
}

pub(crate) trait InverseWithSubstitute: Sized {
    /// Inverts a symmetric matrix, patching non-positive pivots with [`Substitutive::substitute`].
    fn cholesky_inverse_with_substitute(self) -> Option<Self>;
}

impl<T: Substitutive, D: Dim> InverseWithSubstitute for OMatrix<T, D, D>
where
    DefaultAllocator: Allocator<D, D>,
{
    fn cholesky_inverse_with_substitute(self) -> Option<Self> {
        Cholesky::new_with_substitute(self, T::substitute()).map(|cholesky| cholesky.inverse())
    }
}

/// Running first and second moments of a set of 3D vectors.
pub struct VectorSquareSum<T: Scalar> {
    count: usize,
    sum: Vector3<T>,
    square_sum: Matrix3<T>,
}

impl<T> VectorSquareSum<T>
where
    T: ComplexField,
{
    pub fn mean(&self) -> (Vector3<T>, Matrix3<T>) {
        let count: T = nalgebra::convert(self.count as f64);
        let mean = &self.sum / count.clone();
        let covariance = &self.square_sum / count - &mean * mean.transpose();
        (mean, covariance)
    }
    #[inline(always)]
    pub fn count(&self) -> usize {
        self.count
    }
}

impl<T> Default for VectorSquareSum<T>
where
    T: Scalar + Zero,
{
    fn default() -> Self {
        Self {
            count: 0,
            sum: Vector3::zeros(),
            square_sum: Matrix3::zeros(),
        }
    }
}

impl<'a, T> Sum<&'a Vector3<T>> for VectorSquareSum<T>
where
    T: ComplexField,
{
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = &'a Vector3<T>>,
    {
        iter.fold(Self::default(), |mut acc, current| {
            acc.count += 1;
            acc.sum += current;
            acc.square_sum += current * current.transpose();
            acc
        })
    }
}
