//! Linear algebra helpers for the Gaussian models.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn cholesky_factor(p: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn log_det_from_factor(l: &DMatrix<f64>) -> f64
//!     pub fn gaussian_log_density(residual: &DVector<f64>, l: &DMatrix<f64>, log_det: f64) -> f64
//!     pub fn spectral_radius(m: &DMatrix<f64>) -> f64
//!     pub fn stationary_covariance(phi: &DMatrix<f64>, q: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!
//! Strategy for factorisation:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp), only for round-off sized defects

use nalgebra::linalg::Cholesky;
use crate::model::LN_2PI;
use nalgebra::{DMatrix, DVector};

/// Simple matrix symmetrization that removes round-off asymmetry.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Lower Cholesky factor L with P ≈ L Lᵀ, or `None` when P is not positive definite.
///
/// A small diagonal jitter is tried before giving up, scaled to the size of the
/// diagonal so that it only repairs floating point drift and never masks a
/// genuinely indefinite matrix.
pub fn cholesky_factor(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    assert!(p.is_square(), "cholesky_factor: matrix must be square");
    const INITIAL_JITTER: f64 = 1e-14;
    const MAX_JITTER: f64 = 1e-10;

    let p = symmetrize(p);
    if let Some(ch) = Cholesky::new(p.clone()) {
        return Some(ch.l());
    }
    let scale = p.diagonal().iter().fold(0.0f64, |acc, d| acc.max(d.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let mut jitter = INITIAL_JITTER;
    while jitter <= MAX_JITTER {
        let mut pj = p.clone();
        for i in 0..pj.nrows() {
            pj[(i, i)] += jitter * scale;
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch.l());
        }
        jitter *= 10.0;
    }
    None
}

/// log det(P) given its lower Cholesky factor.
pub fn log_det_from_factor(l: &DMatrix<f64>) -> f64 {
    2.0 * l.diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Log density of N(0, P) at `residual`, with P = L Lᵀ and `log_det` = log det(P).
pub fn gaussian_log_density(residual: &DVector<f64>, l: &DMatrix<f64>, log_det: f64) -> f64 {
    let dim = residual.len() as f64;
    match l.solve_lower_triangular(residual) {
        Some(z) => -0.5 * (dim * LN_2PI + log_det + z.norm_squared()),
        None => f64::NEG_INFINITY,
    }
}

/// Largest eigenvalue modulus.
pub fn spectral_radius(m: &DMatrix<f64>) -> f64 {
    assert!(m.is_square(), "spectral_radius: matrix must be square");
    m.complex_eigenvalues()
        .iter()
        .map(|lambda| lambda.norm())
        .fold(0.0, f64::max)
}

/// Solve the discrete Lyapunov equation Σ = Φ Σ Φᵀ + Q.
///
/// Uses vec(Φ Σ Φᵀ) = (Φ ⊗ Φ) vec(Σ), which is fine for the small state
/// dimensions handled here. Returns `None` when (I − Φ ⊗ Φ) is singular.
pub fn stationary_covariance(phi: &DMatrix<f64>, q: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let d = phi.nrows();
    let kron = phi.kronecker(phi);
    let system = DMatrix::<f64>::identity(d * d, d * d) - kron;
    let rhs = DVector::from_column_slice(q.as_slice());
    let solution = system.lu().solve(&rhs)?;
    Some(symmetrize(&DMatrix::from_column_slice(
        d,
        d,
        solution.as_slice(),
    )))
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        a.shape() == b.shape() && (a - b).amax() <= tol
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&s, &s_expected, 1e-15));
    }

    #[test]
    fn t_cholesky_spd() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2]);
        let p = &a * a.transpose();
        let l = cholesky_factor(&p).expect("Cholesky should succeed for SPD");
        assert!(approx_eq(&(&l * l.transpose()), &p, 1e-12));
    }

    #[test]
    fn t_cholesky_rejects_indefinite() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]); // eigenvalues: 3, -1
        assert!(cholesky_factor(&m).is_none());
        assert!(cholesky_factor(&DMatrix::zeros(2, 2)).is_none());
    }

    #[test]
    fn t_gaussian_log_density_scalar() {
        let sigma: f64 = 0.5;
        let l = DMatrix::from_element(1, 1, sigma);
        let log_det = log_det_from_factor(&l);
        let x = DVector::from_element(1, 0.3);
        let expected = -0.5 * (2.0 * std::f64::consts::PI * sigma * sigma).ln()
            - 0.5 * (0.3 / sigma).powi(2);
        assert_approx_eq!(gaussian_log_density(&x, &l, log_det), expected, 1e-12);
    }

    #[test]
    fn t_spectral_radius() {
        let m = DMatrix::from_row_slice(2, 2, &[0.5, 0.0, 0.0, -0.8]);
        assert_approx_eq!(spectral_radius(&m), 0.8, 1e-12);
        // rotation scaled by 0.9 has complex eigenvalues of modulus 0.9
        let r = DMatrix::from_row_slice(2, 2, &[0.0, -0.9, 0.9, 0.0]);
        assert_approx_eq!(spectral_radius(&r), 0.9, 1e-10);
    }

    #[test]
    fn t_stationary_covariance_scalar_ar1() {
        let phi = DMatrix::from_element(1, 1, 0.9);
        let q = DMatrix::from_element(1, 1, 0.25);
        let sigma = stationary_covariance(&phi, &q).unwrap();
        assert_approx_eq!(sigma[(0, 0)], 0.25 / (1.0 - 0.81), 1e-12);
    }

    #[test]
    fn t_stationary_covariance_satisfies_lyapunov() {
        let phi = DMatrix::from_row_slice(2, 2, &[0.7, 0.2, -0.1, 0.5]);
        let q = DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.3, 0.5]);
        let sigma = stationary_covariance(&phi, &q).unwrap();
        let back = &phi * &sigma * phi.transpose() + &q;
        assert!(approx_eq(&back, &sigma, 1e-10));
    }
}
