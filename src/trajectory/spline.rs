use itertools::Itertools;
use nalgebra::SVector;

/// Non-zero diagonals below and including the main one: a sample touches four
/// neighbouring control points.
const BAND: usize = 4;

/// Lower half of a symmetric banded matrix, `lower[i][k]` holding `(i, i - k)`.
#[derive(Debug, Clone)]
struct Banded {
    lower: Vec<[f64; BAND]>,
}

impl Banded {
    fn zeros(size: usize) -> Self {
        Self {
            lower: vec![[0.0; BAND]; size],
        }
    }

    /// Adds `value` at `(row, col)` of the symmetric matrix, `|row - col| < BAND`.
    #[inline]
    fn add(&mut self, row: usize, col: usize, value: f64) {
        let (row, col) = if row >= col { (row, col) } else { (col, row) };
        self.lower[row][row - col] += value;
    }

    /// In-place banded Cholesky, `None` unless positive definite.
    fn cholesky(mut self) -> Option<Self> {
        let size = self.lower.len();
        for i in 0..size {
            let first = i.saturating_sub(BAND - 1);
            for j in first..i {
                let mut sum = self.lower[i][i - j];
                for m in first.max(j.saturating_sub(BAND - 1))..j {
                    sum -= self.lower[i][i - m] * self.lower[j][j - m];
                }
                self.lower[i][i - j] = sum / self.lower[j][0];
            }
            let diagonal = self.lower[i][0]
                - (first..i)
                    .map(|m| self.lower[i][i - m].powi(2))
                    .sum::<f64>();
            if !diagonal.is_finite() || diagonal <= 0.0 {
                return None;
            }
            self.lower[i][0] = diagonal.sqrt();
        }
        Some(self)
    }

    /// Solves `L Lᵀ x = rhs` with `self` holding the factor `L`.
    fn solve<const D: usize>(&self, mut rhs: Vec<SVector<f64, D>>) -> Vec<SVector<f64, D>> {
        let size = self.lower.len();
        for i in 0..size {
            for m in i.saturating_sub(BAND - 1)..i {
                let (head, tail) = rhs.split_at_mut(i);
                tail[0] -= head[m] * self.lower[i][i - m];
            }
            rhs[i] /= self.lower[i][0];
        }
        for i in (0..size).rev() {
            for m in i + 1..size.min(i + BAND) {
                let (head, tail) = rhs.split_at_mut(m);
                head[i] -= tail[0] * self.lower[m][m - i];
            }
            rhs[i] /= self.lower[i][0];
        }
        rhs
    }
}

/// Uniform cubic B-spline over `D`-dimensional values.
///
/// Segment `i` spans `[start + i·interval, start + (i+1)·interval)` and is
/// shaped by control points `i..i+4`.
#[derive(Debug, Clone)]
pub struct UniformCubicSpline<const D: usize> {
    start: f64,
    interval: f64,
    control: Vec<SVector<f64, D>>,
}

/// One sample to fit against.
#[derive(Debug, Clone)]
pub struct SplineSample<const D: usize> {
    pub time: f64,
    pub value: SVector<f64, D>,
    pub weight: f64,
}

/// Basis weights of the four control points of a segment at `s ∈ [0, 1)`.
#[inline]
fn basis(s: f64) -> [f64; 4] {
    let s2 = s * s;
    let s3 = s2 * s;
    [
        (1.0 - s).powi(3) / 6.0,
        (3.0 * s3 - 6.0 * s2 + 4.0) / 6.0,
        (-3.0 * s3 + 3.0 * s2 + 3.0 * s + 1.0) / 6.0,
        s3 / 6.0,
    ]
}

impl<const D: usize> UniformCubicSpline<D> {
    #[inline]
    fn segments(&self) -> usize {
        self.control.len() - 3
    }

    /// First control index and local parameter at `time`, clamped to the
    /// spline's span.
    fn locate(start: f64, interval: f64, segments: usize, time: f64) -> (usize, f64) {
        let u = ((time - start) / interval).max(0.0);
        let index = (u.floor() as usize).min(segments - 1);
        (index, (u - index as f64).min(1.0))
    }

    pub fn evaluate(&self, time: f64) -> SVector<f64, D> {
        let (index, s) = Self::locate(self.start, self.interval, self.segments(), time);
        basis(s)
            .iter()
            .zip(&self.control[index..index + 4])
            .map(|(weight, control)| control * *weight)
            .sum()
    }

    /// Weighted least-squares fit between `start` and `end` with a
    /// second-difference penalty of `smoothness` on the control points.
    ///
    /// `None` if the samples do not pin the curve down.
    pub fn fit(
        samples: &[SplineSample<D>],
        start: f64,
        end: f64,
        interval: f64,
        smoothness: f64,
    ) -> Option<Self> {
        if interval <= 0.0 || end < start {
            return None;
        }
        // a line needs two distinct times
        let (first, last) = samples
            .iter()
            .map(|sample| sample.time)
            .minmax()
            .into_option()?;
        if last - first <= interval * 1e-6 {
            return None;
        }
        let segments = (((end - start) / interval).ceil() as usize).max(1);
        let count = segments + 3;

        let mut normal = Banded::zeros(count);
        let mut rhs = vec![SVector::<f64, D>::zeros(); count];
        for sample in samples {
            let (index, s) = Self::locate(start, interval, segments, sample.time);
            let weights = basis(s);
            for (a, wa) in weights.iter().enumerate() {
                for (b, wb) in weights.iter().enumerate().skip(a) {
                    normal.add(index + b, index + a, sample.weight * wa * wb);
                }
                rhs[index + a] += sample.value * (sample.weight * wa);
            }
        }

        // Σ (c_{k} - 2 c_{k+1} + c_{k+2})²
        let stencil = [1.0, -2.0, 1.0];
        for k in 0..count - 2 {
            for (a, wa) in stencil.iter().enumerate() {
                for (b, wb) in stencil.iter().enumerate().skip(a) {
                    normal.add(k + b, k + a, smoothness * wa * wb);
                }
            }
        }

        let control = normal.cholesky()?.solve(rhs);
        if control.iter().any(|c| c.iter().any(|x| !x.is_finite())) {
            return None;
        }
        Some(Self {
            start,
            interval,
            control,
        })
    }
}
