//! Linear-Gaussian VAR(1) model with Gaussian observations.
//!
//! ```text
//! x_0 ~ N(mu, Σ∞)
//! x_t = mu + Φ (x_{t-1} - mu) + w_t,   w_t ~ N(0, Q)
//! y_t = H x_t + v_t,                   v_t ~ N(0, R)
//! ```
//!
//! Σ∞ solves Σ = Φ Σ Φᵀ + Q. The smoothing distribution of this model is
//! available in closed form (see [`crate::kalman`]), which makes it the
//! reference model for checking the particle smoothers.

use crate::error::{Result, SmoothingError};
use crate::linalg::{
    cholesky_factor, gaussian_log_density, log_det_from_factor, spectral_radius,
    stationary_covariance,
};
use crate::model::{LN_2PI, ModelParameters, Prior, StateSpaceModel};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

fn standard_normal_vector<R: Rng + ?Sized>(rng: &mut R, dim: usize) -> DVector<f64> {
    DVector::<f64>::from_fn(dim, |_, _| StandardNormal.sample(rng))
}

/// Multivariate Gaussian N(mean, cov) usable as a prior γ.
#[derive(Clone, Debug)]
pub struct GaussianPrior {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
    factor: DMatrix<f64>,
    log_det: f64,
}

impl GaussianPrior {
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        if cov.nrows() != mean.len() || cov.ncols() != mean.len() {
            return Err(SmoothingError::InvalidModel(format!(
                "prior covariance is {}x{} but the mean has {} components",
                cov.nrows(),
                cov.ncols(),
                mean.len()
            )));
        }
        let factor = cholesky_factor(&cov).ok_or_else(|| {
            SmoothingError::InvalidModel("prior covariance is not positive definite".into())
        })?;
        let log_det = log_det_from_factor(&factor);
        Ok(GaussianPrior {
            mean,
            cov,
            factor,
            log_det,
        })
    }
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }
}

impl Prior<DVector<f64>> for GaussianPrior {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        &self.mean + &self.factor * standard_normal_vector(rng, self.mean.len())
    }
    fn log_density(&self, x: &DVector<f64>) -> f64 {
        gaussian_log_density(&(x - &self.mean), &self.factor, self.log_det)
    }
}

#[derive(Clone, Debug)]
pub struct LinearGaussian {
    mean: DVector<f64>,
    transition: DMatrix<f64>,
    process_cov: DMatrix<f64>,
    process_factor: DMatrix<f64>,
    process_log_det: f64,
    observation: DMatrix<f64>,
    observation_cov: DMatrix<f64>,
    observation_factor: DMatrix<f64>,
    observation_log_det: f64,
    initial: GaussianPrior,
}

impl LinearGaussian {
    /// Build the model, checking dimensions, positive definiteness of Q and R,
    /// and stationarity of Φ.
    pub fn new(
        mean: DVector<f64>,
        transition: DMatrix<f64>,
        process_cov: DMatrix<f64>,
        observation: DMatrix<f64>,
        observation_cov: DMatrix<f64>,
    ) -> Result<Self> {
        let d = mean.len();
        if d == 0 {
            return Err(SmoothingError::InvalidModel(
                "state dimension must be at least one".into(),
            ));
        }
        if transition.shape() != (d, d) || process_cov.shape() != (d, d) {
            return Err(SmoothingError::InvalidModel(format!(
                "transition {:?} and process covariance {:?} must both be {d}x{d}",
                transition.shape(),
                process_cov.shape()
            )));
        }
        let m = observation.nrows();
        if m == 0 || observation.ncols() != d || observation_cov.shape() != (m, m) {
            return Err(SmoothingError::InvalidModel(format!(
                "observation matrix {:?} and covariance {:?} do not match state dimension {d}",
                observation.shape(),
                observation_cov.shape()
            )));
        }
        let radius = spectral_radius(&transition);
        if !(radius < 1.0) {
            return Err(SmoothingError::InvalidModel(format!(
                "transition matrix has spectral radius {radius}, the stationary law does not exist"
            )));
        }
        let process_factor = cholesky_factor(&process_cov).ok_or_else(|| {
            SmoothingError::InvalidModel("process covariance is not positive definite".into())
        })?;
        let observation_factor = cholesky_factor(&observation_cov).ok_or_else(|| {
            SmoothingError::InvalidModel("observation covariance is not positive definite".into())
        })?;
        let stationary = stationary_covariance(&transition, &process_cov).ok_or_else(|| {
            SmoothingError::InvalidModel("stationary covariance equation is singular".into())
        })?;
        let initial = GaussianPrior::new(mean.clone(), stationary)?;
        Ok(LinearGaussian {
            process_log_det: log_det_from_factor(&process_factor),
            observation_log_det: log_det_from_factor(&observation_factor),
            mean,
            transition,
            process_cov,
            process_factor,
            observation,
            observation_cov,
            observation_factor,
            initial,
        })
    }

    /// One-dimensional AR(1) with `y_t = x_t + N(0, obs_sigma²)`.
    pub fn scalar(params: &ModelParameters, obs_sigma: f64) -> Result<Self> {
        params.validate()?;
        if !(obs_sigma > 0.0 && obs_sigma.is_finite()) {
            return Err(SmoothingError::InvalidModel(format!(
                "observation noise must be positive, got {obs_sigma}"
            )));
        }
        LinearGaussian::new(
            DVector::from_element(1, params.mu),
            DMatrix::from_element(1, 1, params.phi),
            DMatrix::from_element(1, 1, params.sigma * params.sigma),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, obs_sigma * obs_sigma),
        )
    }

    pub fn state_dim(&self) -> usize {
        self.mean.len()
    }
    pub fn observation_dim(&self) -> usize {
        self.observation.nrows()
    }
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn transition(&self) -> &DMatrix<f64> {
        &self.transition
    }
    pub fn process_cov(&self) -> &DMatrix<f64> {
        &self.process_cov
    }
    pub fn observation(&self) -> &DMatrix<f64> {
        &self.observation
    }
    pub fn observation_cov(&self) -> &DMatrix<f64> {
        &self.observation_cov
    }
    pub fn stationary_cov(&self) -> &DMatrix<f64> {
        self.initial.cov()
    }

    /// The stationary law N(mu, Σ∞).
    pub fn stationary_prior(&self) -> GaussianPrior {
        self.initial.clone()
    }

    fn predict(&self, x_prev: &DVector<f64>) -> DVector<f64> {
        &self.mean + &self.transition * (x_prev - &self.mean)
    }
}

impl StateSpaceModel for LinearGaussian {
    type State = DVector<f64>;
    type Observation = DVector<f64>;

    fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<DVector<f64>> {
        (0..n).map(|_| self.initial.sample(rng)).collect()
    }

    fn sample_transition<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        _t: usize,
        x_prev: &DVector<f64>,
    ) -> DVector<f64> {
        self.predict(x_prev) + &self.process_factor * standard_normal_vector(rng, self.state_dim())
    }

    fn log_transition_density(
        &self,
        _t: usize,
        x_prev: &DVector<f64>,
        x_next: &DVector<f64>,
    ) -> f64 {
        let residual = x_next - self.predict(x_prev);
        gaussian_log_density(&residual, &self.process_factor, self.process_log_det)
    }

    fn log_observation_density(&self, _t: usize, x: &DVector<f64>, y: &DVector<f64>) -> f64 {
        let residual = y - &self.observation * x;
        gaussian_log_density(&residual, &self.observation_factor, self.observation_log_det)
    }

    fn upper_bound_log_transition(&self, _t: usize) -> f64 {
        -0.5 * (self.state_dim() as f64 * LN_2PI + self.process_log_det)
    }

    fn sample_observation<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        _t: usize,
        x: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        Ok(&self.observation * x
            + &self.observation_factor * standard_normal_vector(rng, self.observation_dim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiscreteCox, normal_log_density};
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn scalar_model_matches_ar1_densities() {
        let params = ModelParameters::default();
        let lg = LinearGaussian::scalar(&params, 0.7).unwrap();
        let cox = DiscreteCox::new(params).unwrap();
        let x = DVector::from_element(1, 0.3);
        let xn = DVector::from_element(1, -0.2);
        assert_approx_eq!(
            lg.log_transition_density(1, &x, &xn),
            cox.log_transition_density(1, &0.3, &-0.2),
            1e-12
        );
        assert_approx_eq!(
            lg.upper_bound_log_transition(1),
            cox.upper_bound_log_transition(1),
            1e-12
        );
        let y = DVector::from_element(1, 1.0);
        assert_approx_eq!(
            lg.log_observation_density(0, &x, &y),
            normal_log_density(1.0, 0.3, 0.7),
            1e-12
        );
        assert_approx_eq!(
            lg.stationary_cov()[(0, 0)],
            params.stationary_std().powi(2),
            1e-12
        );
    }

    #[test]
    fn construction_rejects_bad_models() {
        let d1 = |v: f64| DMatrix::from_element(1, 1, v);
        let mean = DVector::from_element(1, 0.0);
        // explosive transition
        assert!(LinearGaussian::new(mean.clone(), d1(1.1), d1(1.0), d1(1.0), d1(1.0)).is_err());
        // zero process noise
        assert!(LinearGaussian::new(mean.clone(), d1(0.5), d1(0.0), d1(1.0), d1(1.0)).is_err());
        // negative observation noise
        assert!(LinearGaussian::new(mean.clone(), d1(0.5), d1(1.0), d1(1.0), d1(-1.0)).is_err());
        // dimension mismatch
        assert!(
            LinearGaussian::new(mean, d1(0.5), d1(1.0), DMatrix::zeros(1, 2), d1(1.0)).is_err()
        );
        assert!(LinearGaussian::scalar(&ModelParameters::default(), 0.0).is_err());
    }

    #[test]
    fn multivariate_prior_density_matches_scalar_product() {
        let mean = DVector::from_vec(vec![1.0, -1.0]);
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.25, 4.0]));
        let prior = GaussianPrior::new(mean, cov).unwrap();
        let x = DVector::from_vec(vec![1.5, 0.0]);
        let expected = normal_log_density(1.5, 1.0, 0.5) + normal_log_density(0.0, -1.0, 2.0);
        assert_approx_eq!(prior.log_density(&x), expected, 1e-12);
    }

    #[test]
    fn simulated_states_have_stationary_spread() {
        let params = ModelParameters::new(0.5, 0.8, 0.3).unwrap();
        let lg = LinearGaussian::scalar(&params, 1.0).unwrap();
        let draws = lg.sample_initial(&mut StdRng::seed_from_u64(2), 20_000);
        let n = draws.len() as f64;
        let mean = draws.iter().map(|x| x[0]).sum::<f64>() / n;
        let var = draws.iter().map(|x| (x[0] - mean).powi(2)).sum::<f64>() / (n - 1.0);
        assert_approx_eq!(mean, 0.5, 0.02);
        assert_approx_eq!(var, params.stationary_std().powi(2), 0.01);
    }
}
