//! Shared numerical kernels for the fitting and model-selection code.
//!
//! Everything here is deterministic and allocation-light: special functions
//! needed by the Dirichlet fixed point (ln-gamma, digamma), row-wise softmax,
//! and the two linear-algebra helpers the Laplace evidence approximation
//! depends on (a log-determinant with an eigenvalue fallback, and an
//! eigen-truncated pseudoinverse).

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Cholesky, Eigh, UPLO};

/// Floor applied before taking the logarithm of any probability.
pub const PROB_EPS: f64 = 1e-13;

/// Eigenvalues with magnitude at or below this are treated as zero when
/// building a pseudoinverse.
const EIGEN_EPS: f64 = 1e-10;

/// Natural log of the gamma function for `x > 0`.
///
/// Shifts small arguments up with the recurrence `Γ(x+1) = xΓ(x)` and then
/// applies Stirling's series with Bernoulli corrections. Accurate to ~1e-10
/// over the range the Dirichlet updates exercise.
pub fn ln_gamma(x: f64) -> f64 {
    if x <= 0.0 {
        return f64::INFINITY;
    }
    let mut x = x;
    let mut result = 0.0;
    while x < 10.0 {
        result -= x.ln();
        x += 1.0;
    }
    let inv_x = 1.0 / x;
    let inv_x2 = inv_x * inv_x;
    let correction = inv_x * (1.0 / 12.0 - inv_x2 * (1.0 / 360.0 - inv_x2 / 1260.0));
    result + (x - 0.5) * x.ln() - x + 0.5 * (2.0 * std::f64::consts::PI).ln() + correction
}

/// Digamma function ψ(x) = d/dx ln Γ(x), for `x > 0`.
pub fn digamma(x: f64) -> f64 {
    if x <= 0.0 {
        return f64::NAN;
    }
    let mut result = 0.0;
    let mut x = x;
    while x < 6.0 {
        result -= 1.0 / x;
        x += 1.0;
    }
    let inv_x = 1.0 / x;
    let inv_x2 = inv_x * inv_x;
    result + x.ln() - 0.5 * inv_x - inv_x2 / 12.0 + inv_x2 * inv_x2 / 120.0
        - inv_x2 * inv_x2 * inv_x2 / 252.0
}

/// Row-wise softmax with the max-subtraction trick.
pub fn softmax_rows(m: ArrayView2<f64>) -> Array2<f64> {
    let mut out = m.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Log-determinant of a symmetric positive-(semi)definite matrix.
///
/// Tries a Cholesky factorization first; if the matrix is indefinite the
/// factorization fails and we fall back to a symmetric eigendecomposition,
/// summing the logs of the eigenvalues. Returns a non-finite value when any
/// eigenvalue is non-positive, which callers treat as "determinant
/// unavailable" rather than an error.
pub fn log_det_symmetric(m: ArrayView2<f64>) -> f64 {
    match m.cholesky(UPLO::Lower) {
        Ok(l) => 2.0 * l.diag().mapv(f64::ln).sum(),
        Err(_) => match m.eigh(UPLO::Lower) {
            Ok((eigvals, _)) => eigvals.mapv(f64::ln).sum(),
            Err(_) => f64::NAN,
        },
    }
}

/// Moore–Penrose pseudoinverse of a symmetric matrix via eigendecomposition.
///
/// Eigenvalues with magnitude at most `EIGEN_EPS` are truncated to zero so a
/// nearly singular curvature matrix still yields finite posterior variances.
pub fn pseudo_inverse_symmetric(m: ArrayView2<f64>) -> Option<Array2<f64>> {
    let (eigvals, eigvecs) = m.eigh(UPLO::Lower).ok()?;
    let n = eigvals.len();
    let mut inv_vals = Array1::zeros(n);
    for (i, &v) in eigvals.iter().enumerate() {
        if v.abs() > EIGEN_EPS {
            inv_vals[i] = 1.0 / v;
        }
    }
    // V * diag(1/λ) * Vᵀ
    let scaled = &eigvecs * &inv_vals.view().insert_axis(Axis(0));
    Some(scaled.dot(&eigvecs.t()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn ln_gamma_matches_factorials() {
        // Γ(n) = (n-1)!
        assert_abs_diff_eq!(ln_gamma(1.0), 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(ln_gamma(2.0), 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(ln_gamma(5.0), 24f64.ln(), epsilon = 1e-8);
        assert_abs_diff_eq!(ln_gamma(0.5), std::f64::consts::PI.sqrt().ln(), epsilon = 1e-8);
    }

    #[test]
    fn digamma_recurrence_holds() {
        // ψ(x+1) = ψ(x) + 1/x
        for &x in &[0.3, 1.0, 2.5, 7.0] {
            assert_abs_diff_eq!(digamma(x + 1.0), digamma(x) + 1.0 / x, epsilon = 1e-8);
        }
        // ψ(1) = -γ (Euler–Mascheroni)
        assert_abs_diff_eq!(digamma(1.0), -0.577_215_664_901_532_9, epsilon = 1e-8);
    }

    #[test]
    fn softmax_rows_normalize() {
        let m = array![[1.0, 2.0, 3.0], [1000.0, 1000.0, 1000.0]];
        let s = softmax_rows(m.view());
        for row in s.axis_iter(ndarray::Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        // uniform row stays uniform even at overflow-prone magnitudes
        assert_abs_diff_eq!(s[[1, 0]], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn log_det_of_diagonal() {
        let m = array![[4.0, 0.0], [0.0, 9.0]];
        assert_abs_diff_eq!(log_det_symmetric(m.view()), 36f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn pseudo_inverse_inverts_spd() {
        let m = array![[2.0, 1.0], [1.0, 2.0]];
        let inv = pseudo_inverse_symmetric(m.view()).unwrap();
        let prod = m.dot(&inv);
        assert_abs_diff_eq!(prod[[0, 0]], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(prod[[0, 1]], 0.0, epsilon = 1e-8);
    }
}
