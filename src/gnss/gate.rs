use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

/// Confidence level of the chi-square innovation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum GateConfidence {
    #[serde(rename = "0.95")]
    P95,
    #[default]
    #[serde(rename = "0.99")]
    P99,
    #[serde(rename = "0.999")]
    P999,
}

impl GateConfidence {
    /// Standard normal quantile of the confidence level.
    fn normal_quantile(self) -> f64 {
        match self {
            Self::P95 => 1.644_853_6,
            Self::P99 => 2.326_347_9,
            Self::P999 => 3.090_232_3,
        }
    }
}

/// Wilson–Hilferty approximation of the chi-square quantile.
pub fn chi_square_quantile(dof: usize, confidence: GateConfidence) -> f64 {
    if dof == 0 {
        return 0.0;
    }
    let k = dof as f64;
    let h = 2.0 / (9.0 * k);
    k * (1.0 - h + confidence.normal_quantile() * h.sqrt()).powi(3)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InnovationGate {
    pub confidence: GateConfidence,
}

impl InnovationGate {
    pub const fn new(confidence: GateConfidence) -> Self {
        Self { confidence }
    }

    /// `rᵀ S⁻¹ r ≤ χ²(dof)`. A non positive-definite `S` never passes.
    pub fn accepts(&self, residual: &DVector<f64>, innovation_cov: DMatrix<f64>, dof: usize) -> bool {
        if dof == 0 {
            return true;
        }
        let Some(cholesky) = innovation_cov.cholesky() else {
            return false;
        };
        let whitened = cholesky.solve(residual);
        let nis = residual.dot(&whitened);
        let threshold = chi_square_quantile(dof, self.confidence);
        log::trace!("innovation gate: nis {nis:.3} / {threshold:.3} (dof {dof})");
        nis.is_finite() && nis <= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quantile_close_to_tables() {
        assert_relative_eq!(chi_square_quantile(10, GateConfidence::P95), 18.307, epsilon = 0.1);
        assert_relative_eq!(chi_square_quantile(10, GateConfidence::P99), 23.209, epsilon = 0.1);
        assert_relative_eq!(chi_square_quantile(30, GateConfidence::P99), 50.892, epsilon = 0.1);
    }

    #[test]
    fn test_gate() {
        let gate = InnovationGate::new(GateConfidence::P99);
        let cov = DMatrix::identity(3, 3);
        assert!(gate.accepts(&DVector::from_vec(vec![1.0, -1.0, 0.5]), cov.clone(), 3));
        assert!(!gate.accepts(&DVector::from_vec(vec![10.0, -1.0, 0.5]), cov, 3));
        assert!(!gate.accepts(&DVector::from_vec(vec![1.0]), DMatrix::from_element(1, 1, -1.0), 1));
    }
}
