//! Measurement interface and the iterated update.
//!
//! Every sensor contributes rows through [`Measurement`]. The rows are
//! stacked into one system and solved by the iterated error-state update:
//!
//! ```text
//! Predict ─> BuildResidual ─> Solve ─┬─> Converged
//!                 ^                  ├─> MaxIterations
//!                 ╰──── not yet ─────┤
//!                                    ╰─> Rejected
//! ```

use nalgebra::{
    ComplexField, DMatrix, DVector, DefaultAllocator, DimName, Dyn, Matrix, OMatrix, OVector, RealField, Scalar,
    Storage, allocator::Allocator,
};

use crate::utils::{InverseWithSubstitute, ViewDiagonalMut};

use super::{
    Eskf, StatePredictor,
    state::{KFState, Manifold, SubStateOf},
};

/// A slice of a measurement Jacobian, positioned at the column offset of the
/// sub-state it differentiates against. Sub-states a measurement does not
/// touch simply have no block, which stacks as zero columns.
#[derive(Debug, Clone)]
pub struct JacobianBlock<T: Scalar> {
    pub offset: usize,
    pub value: DMatrix<T>,
}

impl<T: Scalar> JacobianBlock<T> {
    pub fn of<Sub, Super>(value: DMatrix<T>) -> Self
    where
        Super: KFState,
        Sub: SubStateOf<Super>,
    {
        debug_assert_eq!(value.ncols(), Sub::Dim::DIM);
        Self {
            offset: Sub::Offset::DIM,
            value,
        }
    }
}

/// Copies any matrix into a heap matrix of the same shape.
pub fn dynamic<T, R, C, St>(value: &Matrix<T, R, C, St>) -> DMatrix<T>
where
    T: Scalar,
    R: nalgebra::Dim,
    C: nalgebra::Dim,
    St: Storage<T, R, C>,
{
    let (rows, cols) = value.shape();
    DMatrix::from_iterator(rows, cols, value.iter().cloned())
}

/// One source of measurement rows, linearized at a given state.
pub trait Measurement<S: KFState> {
    /// `z - h(x)`, evaluated at `state`.
    fn residual(&self, state: &S) -> DVector<S::Element>;

    /// `∂h/∂δx` at `state`, split by sub-state.
    fn jacobian_blocks(&self, state: &S) -> Vec<JacobianBlock<S::Element>>;

    /// Diagonal of the measurement noise covariance.
    fn noise(&self) -> DVector<S::Element>;
}

/// All measurement rows of one update event.
pub struct Stacked<T, D>
where
    T: Scalar,
    D: DimName,
    DefaultAllocator: Allocator<Dyn, D>,
{
    pub residual: DVector<T>,
    pub jacobian: OMatrix<T, Dyn, D>,
    pub noise: DVector<T>,
}

impl<T, D> Stacked<T, D>
where
    T: RealField,
    D: DimName,
    DefaultAllocator: Allocator<Dyn, D> + Allocator<Dyn>,
{
    pub fn new<S, M>(state: &S, measurements: &[M]) -> Self
    where
        S: KFState<Element = T, Dim = D>,
        M: Measurement<S>,
    {
        let residuals: Vec<_> = measurements.iter().map(|m| m.residual(state)).collect();
        let rows = residuals.iter().map(|r| r.len()).sum();

        let mut residual = DVector::zeros(rows);
        let mut jacobian = OMatrix::zeros_generic(Dyn(rows), D::name());
        let mut noise = DVector::zeros(rows);

        let mut row = 0;
        for (measurement, r) in measurements.iter().zip(residuals) {
            let dim = r.len();
            residual.rows_mut(row, dim).copy_from(&r);
            noise.rows_mut(row, dim).copy_from(&measurement.noise());
            for block in measurement.jacobian_blocks(state) {
                jacobian
                    .view_mut((row, block.offset), block.value.shape())
                    .copy_from(&block.value);
            }
            row += dim;
        }

        Self {
            residual,
            jacobian,
            noise,
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.residual.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IterationConfig<T> {
    pub max_iterations: usize,
    /// Infinity norm of the change of the correction between two iterations.
    pub convergence_threshold: T,
}

impl Default for IterationConfig<f64> {
    fn default() -> Self {
        Self {
            max_iterations: 4,
            convergence_threshold: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Converged { iterations: usize },
    MaxIterations,
    /// Nothing to fuse, the predicted state is kept.
    Skipped,
    /// The predicted state is kept and the event is dropped.
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Too few LiDAR points found a plane to match against.
    TooFewCorrespondences,
    /// The innovation failed the chi-square gate.
    InnovationGate,
    /// The solve produced non-finite numbers.
    NumericalFailure,
}

impl UpdateOutcome {
    /// Whether the state and covariance were corrected.
    #[inline]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Converged { .. } | Self::MaxIterations)
    }
}

enum UpdatePhase<P, T, D>
where
    T: Scalar,
    D: DimName,
    DefaultAllocator: Allocator<Dyn, D>,
{
    Predict(P),
    BuildResidual { iteration: usize },
    Solve {
        iteration: usize,
        stacked: Stacked<T, D>,
    },
    Done(UpdateOutcome),
}

struct Linearization<T, D>
where
    T: Scalar,
    D: DimName,
    DefaultAllocator: Allocator<Dyn, D> + Allocator<D, Dyn>,
{
    gain: OMatrix<T, D, Dyn>,
    jacobian: OMatrix<T, Dyn, D>,
    noise: DVector<T>,
}

impl<S> Eskf<S>
where
    S: Manifold<Element: RealField>,
    DefaultAllocator: Allocator<S::Dim, S::Dim>
        + Allocator<S::Dim>
        + Allocator<Dyn, S::Dim>
        + Allocator<S::Dim, Dyn>
        + Allocator<Dyn>
        + Allocator<Dyn, Dyn>,
{
    /// Runs one update event.
    ///
    /// `build` is called once on the predicted filter and returns the
    /// measurements to fuse, or why the event has to be dropped. The
    /// measurements are then re-linearized at every iterate. State and
    /// covariance are only written when the event ends converged or at the
    /// iteration limit.
    pub fn update<P, M>(
        &mut self,
        prediction: P,
        config: &IterationConfig<S::Element>,
        build: impl FnOnce(&Self) -> Result<Vec<M>, RejectReason>,
    ) -> UpdateOutcome
    where
        Self: StatePredictor<P>,
        M: Measurement<S>,
    {
        let mut build = Some(build);
        let mut measurements = Vec::new();
        let mut iterate = self.state.clone();
        let mut correction = OVector::<S::Element, S::Dim>::zeros();
        let mut linearization = None;

        let mut phase = UpdatePhase::Predict(prediction);
        loop {
            phase = match phase {
                UpdatePhase::Predict(prediction) => {
                    self.predict(prediction);
                    iterate = self.state.clone();
                    UpdatePhase::BuildResidual { iteration: 0 }
                }
                UpdatePhase::BuildResidual { iteration } => {
                    if let Some(build) = build.take() {
                        match build(self) {
                            Ok(built) => measurements = built,
                            Err(reason) => {
                                phase = UpdatePhase::Done(UpdateOutcome::Rejected(reason));
                                continue;
                            }
                        }
                    }
                    if measurements.is_empty() {
                        UpdatePhase::Done(UpdateOutcome::Skipped)
                    } else {
                        UpdatePhase::Solve {
                            iteration,
                            stacked: Stacked::new(&iterate, &measurements),
                        }
                    }
                }
                UpdatePhase::Solve { iteration, stacked } => {
                    let Stacked {
                        residual,
                        jacobian,
                        noise,
                    } = stacked;

                    // e_j: where the current iterate sits relative to the prior
                    let offset = iterate.boxminus(&self.state);

                    let cross_cov = &*self.cov * jacobian.transpose();
                    let innovation_cov = (&jacobian * &cross_cov).diagonal_add(&noise);

                    let Some(innovation_inv) = innovation_cov.cholesky_inverse_with_substitute()
                    else {
                        phase = UpdatePhase::Done(UpdateOutcome::Rejected(
                            RejectReason::NumericalFailure,
                        ));
                        continue;
                    };
                    let gain = cross_cov * innovation_inv;
                    let next = &gain * (residual + &jacobian * &offset);

                    if next.iter().any(|x| !x.is_finite()) {
                        phase =
                            UpdatePhase::Done(UpdateOutcome::Rejected(RejectReason::NumericalFailure));
                        continue;
                    }

                    let step = (&next - &correction).amax();
                    iterate = self.state.clone();
                    iterate.boxplus(&next);
                    correction = next;
                    linearization = Some(Linearization {
                        gain,
                        jacobian,
                        noise,
                    });

                    if step < config.convergence_threshold {
                        UpdatePhase::Done(UpdateOutcome::Converged {
                            iterations: iteration + 1,
                        })
                    } else if iteration + 1 >= config.max_iterations {
                        UpdatePhase::Done(UpdateOutcome::MaxIterations)
                    } else {
                        UpdatePhase::BuildResidual {
                            iteration: iteration + 1,
                        }
                    }
                }
                UpdatePhase::Done(outcome) => {
                    if let (true, Some(linearization)) = (outcome.is_applied(), linearization) {
                        self.commit(iterate, linearization);
                    }
                    return outcome;
                }
            };
        }
    }

    /// Writes the accepted iterate and the Joseph-form covariance.
    fn commit(&mut self, state: S, linearization: Linearization<S::Element, S::Dim>) {
        let Linearization {
            gain,
            jacobian,
            noise,
        } = linearization;

        let identity = OMatrix::<S::Element, S::Dim, S::Dim>::identity();
        let i_kh = identity - &gain * &jacobian;
        let noise_part = &gain * DMatrix::from_diagonal(&noise) * gain.transpose();
        let cov = &i_kh * &*self.cov * i_kh.transpose() + noise_part;

        self.state = state;
        self.cov.0 = cov;
        self.cov.symmetrize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eskf::{Covariance, DeltaTime};
    use nalgebra::{U3, Vector3};

    #[derive(Debug, Clone, Default)]
    struct Point(Vector3<f64>);

    impl KFState for Point {
        type Element = f64;
        type Dim = U3;
    }

    impl Manifold for Point {
        fn boxplus(&mut self, delta: &Vector3<f64>) {
            self.0 += delta;
        }
        fn boxminus(&self, origin: &Self) -> Vector3<f64> {
            self.0 - origin.0
        }
    }

    impl StatePredictor<DeltaTime<f64>> for Eskf<Point> {
        fn predict(&mut self, _dt: DeltaTime<f64>) {}
    }

    struct Range {
        anchor: Vector3<f64>,
        range: f64,
    }

    impl Measurement<Point> for Range {
        fn residual(&self, state: &Point) -> DVector<f64> {
            DVector::from_element(1, self.range - (state.0 - self.anchor).norm())
        }
        fn jacobian_blocks(&self, state: &Point) -> Vec<JacobianBlock<f64>> {
            let unit = (state.0 - self.anchor).normalize();
            vec![JacobianBlock::of::<Point, Point>(dynamic(&unit.transpose()))]
        }
        fn noise(&self) -> DVector<f64> {
            DVector::from_element(1, 1e-6)
        }
    }

    impl SubStateOf<Point> for Point {
        type Offset = nalgebra::U0;
    }

    fn ranges(truth: Vector3<f64>) -> Vec<Range> {
        [
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(0.0, 10.0, 0.0),
            Vector3::new(0.0, 0.0, 10.0),
            Vector3::new(-10.0, -10.0, 0.0),
        ]
        .into_iter()
        .map(|anchor| Range {
            anchor,
            range: (truth - anchor).norm(),
        })
        .collect()
    }

    #[test]
    fn test_iterated_update_converges_on_nonlinear_ranges() {
        let truth = Vector3::new(1.0, -0.5, 0.3);
        let mut eskf = Eskf::new_with_state(Point::default(), 1.0, Covariance::default(), 0.0);
        let config = IterationConfig {
            max_iterations: 10,
            convergence_threshold: 1e-9,
        };

        let outcome = eskf.update(DeltaTime::all(0.0), &config, |_| Ok(ranges(truth)));

        assert!(matches!(outcome, UpdateOutcome::Converged { .. }));
        assert!((eskf.state.0 - truth).norm() < 1e-4);
        assert!(eskf.cov.asymmetry() < 1e-12);
        assert!(eskf.cov.diagonal().iter().all(|v| *v > 0.0 && *v < 1.0));
    }

    #[test]
    fn test_rejected_update_keeps_prior() {
        let mut eskf = Eskf::new_with_state(Point::default(), 1.0, Covariance::default(), 0.0);
        let before = eskf.cov.0;

        let outcome = eskf.update(DeltaTime::all(0.0), &IterationConfig::default(), |_| {
            Err::<Vec<Range>, _>(RejectReason::InnovationGate)
        });

        assert_eq!(
            outcome,
            UpdateOutcome::Rejected(RejectReason::InnovationGate)
        );
        assert_eq!(eskf.state.0, Vector3::zeros());
        assert_eq!(eskf.cov.0, before);
    }

    #[test]
    fn test_empty_update_is_skipped() {
        let mut eskf = Eskf::new_with_state(Point::default(), 1.0, Covariance::default(), 0.0);
        let outcome = eskf.update(DeltaTime::all(0.0), &IterationConfig::default(), |_| {
            Ok(Vec::<Range>::new())
        });
        assert_eq!(outcome, UpdateOutcome::Skipped);
    }

    #[test]
    fn test_stacking_places_blocks() {
        let truth = Vector3::new(1.0, 2.0, 3.0);
        let stacked = Stacked::new(&Point(truth), &ranges(truth));
        assert_eq!(stacked.rows(), 4);
        assert!(stacked.residual.amax() < 1e-12);
        for row in stacked.jacobian.row_iter() {
            assert!((row.norm() - 1.0).abs() < 1e-12);
        }
    }
}
