//! Closed-form smoothing for the linear-Gaussian model.
//!
//! Kalman filter followed by the Rauch–Tung–Striebel (RTS) backward pass. The
//! result provides the exact smoothing moments that the particle smoothers
//! approximate, including the lag-one cross-covariances needed for additive
//! functionals of consecutive states.

use crate::error::{Result, SmoothingError};
use crate::linalg::{cholesky_factor, gaussian_log_density, log_det_from_factor, symmetrize};
use crate::linear_gaussian::LinearGaussian;
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};

/// Filtering and smoothing moments for t = 0..T-1.
#[derive(Clone, Debug)]
pub struct GaussianSmoothing {
    /// $m_{t|t-1}$, with $m_{0|-1} = \mu$.
    pub predicted_means: Vec<DVector<f64>>,
    /// $P_{t|t-1}$, with $P_{0|-1} = \Sigma_\infty$.
    pub predicted_covs: Vec<DMatrix<f64>>,
    pub filtered_means: Vec<DVector<f64>>,
    pub filtered_covs: Vec<DMatrix<f64>>,
    pub smoothed_means: Vec<DVector<f64>>,
    pub smoothed_covs: Vec<DMatrix<f64>>,
    /// $\mathrm{Cov}(x_t, x_{t+1} \mid y_{0:T-1})$ for t = 0..T-2.
    pub lag_one_covs: Vec<DMatrix<f64>>,
    /// $\log p(y_{0:T-1})$.
    pub log_likelihood: f64,
}

impl GaussianSmoothing {
    pub fn len(&self) -> usize {
        self.smoothed_means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.smoothed_means.is_empty()
    }

    /// $E[x_t^\top x_{t+1} \mid y] = \mathrm{tr}\,\mathrm{Cov}(x_t, x_{t+1} \mid y) + m_t^\top m_{t+1}$.
    pub fn expected_lag_product(&self, t: usize) -> f64 {
        self.lag_one_covs[t].trace() + self.smoothed_means[t].dot(&self.smoothed_means[t + 1])
    }

    /// Sum of [`Self::expected_lag_product`] over t = 0..T-2.
    pub fn expected_lag_product_total(&self) -> f64 {
        (0..self.lag_one_covs.len())
            .map(|t| self.expected_lag_product(t))
            .sum()
    }
}

fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>, what: &str) -> Result<DMatrix<f64>> {
    let chol = Cholesky::new(symmetrize(a))
        .ok_or_else(|| SmoothingError::InvalidModel(format!("{what} is not positive definite")))?;
    Ok(chol.solve(b))
}

/// Run the Kalman filter and RTS smoother over `observations`.
pub fn kalman_smoother(
    model: &LinearGaussian,
    observations: &[DVector<f64>],
) -> Result<GaussianSmoothing> {
    if observations.is_empty() {
        return Err(SmoothingError::EmptyObservations);
    }
    let d = model.state_dim();
    let h = model.observation();
    let phi = model.transition();
    let mu = model.mean();

    let horizon = observations.len();
    let mut predicted_means = Vec::with_capacity(horizon);
    let mut predicted_covs = Vec::with_capacity(horizon);
    let mut filtered_means: Vec<DVector<f64>> = Vec::with_capacity(horizon);
    let mut filtered_covs: Vec<DMatrix<f64>> = Vec::with_capacity(horizon);
    let mut log_likelihood = 0.0;

    for (t, y) in observations.iter().enumerate() {
        if y.len() != model.observation_dim() {
            return Err(SmoothingError::InvalidInput(format!(
                "observation {t} has {} components, expected {}",
                y.len(),
                model.observation_dim()
            )));
        }
        let (m_pred, p_pred) = match (filtered_means.last(), filtered_covs.last()) {
            (Some(m), Some(p)) => (
                mu + phi * (m - mu),
                symmetrize(&(phi * p * phi.transpose() + model.process_cov())),
            ),
            _ => (mu.clone(), model.stationary_cov().clone()),
        };

        // innovation
        let s = symmetrize(&(h * &p_pred * h.transpose() + model.observation_cov()));
        let s_factor = cholesky_factor(&s).ok_or_else(|| {
            SmoothingError::InvalidModel(format!("innovation covariance at t = {t} is not positive definite"))
        })?;
        let residual = y - h * &m_pred;
        log_likelihood += gaussian_log_density(&residual, &s_factor, log_det_from_factor(&s_factor));

        // K = P Hᵀ S⁻¹, computed as (S⁻¹ H P)ᵀ
        let gain = spd_solve(&s, &(h * &p_pred), "innovation covariance")?.transpose();
        let m_filt = &m_pred + &gain * residual;
        // Joseph form keeps P symmetric positive semi-definite
        let i_kh = DMatrix::<f64>::identity(d, d) - &gain * h;
        let p_filt = symmetrize(
            &(&i_kh * &p_pred * i_kh.transpose()
                + &gain * model.observation_cov() * gain.transpose()),
        );

        predicted_means.push(m_pred);
        predicted_covs.push(p_pred);
        filtered_means.push(m_filt);
        filtered_covs.push(p_filt);
    }

    let mut smoothed_means = filtered_means.clone();
    let mut smoothed_covs = filtered_covs.clone();
    let mut lag_one_covs = vec![DMatrix::<f64>::zeros(d, d); horizon - 1];
    for t in (0..horizon - 1).rev() {
        // G_t = P_{t|t} Φᵀ P_{t+1|t}⁻¹, computed as (P_{t+1|t}⁻¹ Φ P_{t|t})ᵀ
        let g = spd_solve(
            &predicted_covs[t + 1],
            &(phi * &filtered_covs[t]),
            "predicted covariance",
        )?
        .transpose();
        smoothed_means[t] =
            &filtered_means[t] + &g * (&smoothed_means[t + 1] - &predicted_means[t + 1]);
        smoothed_covs[t] = symmetrize(
            &(&filtered_covs[t]
                + &g * (&smoothed_covs[t + 1] - &predicted_covs[t + 1]) * g.transpose()),
        );
        lag_one_covs[t] = &g * &smoothed_covs[t + 1];
    }

    Ok(GaussianSmoothing {
        predicted_means,
        predicted_covs,
        filtered_means,
        filtered_covs,
        smoothed_means,
        smoothed_covs,
        lag_one_covs,
        log_likelihood,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelParameters, StateSpaceModel};
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Condition the joint Gaussian of (x0, x1, y0, y1) directly.
    #[test]
    fn two_step_smoother_matches_direct_conditioning() {
        let params = ModelParameters::new(0.3, 0.8, 0.6).unwrap();
        let r: f64 = 0.5;
        let model = LinearGaussian::scalar(&params, r.sqrt()).unwrap();
        let y = [DVector::from_element(1, 1.2), DVector::from_element(1, -0.4)];
        let ks = kalman_smoother(&model, &y).unwrap();

        let s = params.stationary_std().powi(2);
        let phi = params.phi;
        let sxx = DMatrix::from_row_slice(2, 2, &[s, phi * s, phi * s, s]);
        let syy = &sxx + DMatrix::identity(2, 2) * r;
        let syy_inv = syy.clone().try_inverse().unwrap();
        let dy = DVector::from_vec(vec![1.2 - params.mu, -0.4 - params.mu]);
        let mean = DVector::from_element(2, params.mu) + &sxx * &syy_inv * dy;
        let cov = &sxx - &sxx * &syy_inv * &sxx;

        assert_approx_eq!(ks.smoothed_means[0][0], mean[0], 1e-12);
        assert_approx_eq!(ks.smoothed_means[1][0], mean[1], 1e-12);
        assert_approx_eq!(ks.smoothed_covs[0][(0, 0)], cov[(0, 0)], 1e-12);
        assert_approx_eq!(ks.lag_one_covs[0][(0, 0)], cov[(0, 1)], 1e-12);
        assert_approx_eq!(ks.expected_lag_product(0), cov[(0, 1)] + mean[0] * mean[1], 1e-12);

        // log p(y) of the bivariate marginal
        let centred = DVector::from_vec(vec![1.2 - params.mu, -0.4 - params.mu]);
        let quad = (centred.transpose() * &syy_inv * &centred)[(0, 0)];
        let expected =
            -0.5 * (2.0 * (2.0 * std::f64::consts::PI).ln() + syy.determinant().ln() + quad);
        assert_approx_eq!(ks.log_likelihood, expected, 1e-10);
    }

    #[test]
    fn last_smoothed_moment_is_the_filtered_one() {
        let params = ModelParameters::default();
        let model = LinearGaussian::scalar(&params, 1.0).unwrap();
        let (_, y) = model.simulate(&mut StdRng::seed_from_u64(12), 25).unwrap();
        let ks = kalman_smoother(&model, &y).unwrap();
        assert_eq!(ks.len(), 25);
        assert_eq!(ks.lag_one_covs.len(), 24);
        assert_eq!(ks.smoothed_means[24], ks.filtered_means[24]);
        for t in 0..25 {
            // smoothing never increases the variance
            assert!(ks.smoothed_covs[t][(0, 0)] <= ks.filtered_covs[t][(0, 0)] + 1e-12);
        }
    }

    #[test]
    fn single_observation_has_no_lag_terms() {
        let model = LinearGaussian::scalar(&ModelParameters::default(), 1.0).unwrap();
        let ks = kalman_smoother(&model, &[DVector::from_element(1, 0.2)]).unwrap();
        assert!(ks.lag_one_covs.is_empty());
        assert_eq!(ks.expected_lag_product_total(), 0.0);
        assert!(kalman_smoother(&model, &[]).is_err());
        assert!(kalman_smoother(&model, &[DVector::zeros(2)]).is_err());
    }
}
