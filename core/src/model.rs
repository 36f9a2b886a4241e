//! State-space model contract and the discrete Cox (Poisson count) model.
//!
//! A model supplies the initial law, a transition sampler and density, an
//! observation density, and an upper bound on the log transition density. The
//! time index passed to the transition methods is the index of the *destination*
//! state, so `sample_transition(rng, t, x)` draws `X_t` given `X_{t-1} = x`.
//!
//! Models validate their parameters at construction. Nothing in the filter or
//! the smoothers re-checks them, so an invalid variance is rejected here rather
//! than turning into NaN weights halfway through a run.

use crate::error::{Result, SmoothingError};
use nalgebra::DVector;
use rand::Rng;
use rand_distr::{Distribution, Normal, Poisson};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::fmt::Debug;

pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Log density of a univariate normal distribution.
#[inline]
pub(crate) fn normal_log_density(x: f64, mean: f64, std: f64) -> f64 {
    let z = (x - mean) / std;
    -0.5 * (LN_2PI + z * z) - std.ln()
}

/// Read-only view of a state as a flat slice of reals.
pub trait StateVector {
    fn components(&self) -> &[f64];

    fn dim(&self) -> usize {
        self.components().len()
    }
}

impl StateVector for f64 {
    fn components(&self) -> &[f64] {
        std::slice::from_ref(self)
    }
}

impl StateVector for DVector<f64> {
    fn components(&self) -> &[f64] {
        self.as_slice()
    }
}

/// Hidden Markov model consumed by the particle filter and the smoothers.
pub trait StateSpaceModel: Sync {
    type State: Clone + Debug + Send + Sync + StateVector;
    type Observation: Clone + Debug + Send + Sync;

    /// Draw `n` states from the initial law p0.
    fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<Self::State>;

    /// Draw `X_t` given `X_{t-1} = x_prev`.
    fn sample_transition<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        t: usize,
        x_prev: &Self::State,
    ) -> Self::State;

    /// log p_t(x_next | x_prev).
    fn log_transition_density(&self, t: usize, x_prev: &Self::State, x_next: &Self::State)
    -> f64;

    /// log f_t(y | x).
    fn log_observation_density(&self, t: usize, x: &Self::State, y: &Self::Observation) -> f64;

    /// A constant `M_t` with `log p_t(x' | x) <= M_t` for every pair of states.
    ///
    /// Only the O(N) rejection sampler uses it. A loose bound lowers its
    /// acceptance rate; it never changes the result.
    fn upper_bound_log_transition(&self, t: usize) -> f64;

    /// Draw `Y_t` given `X_t = x`.
    fn sample_observation<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        t: usize,
        x: &Self::State,
    ) -> Result<Self::Observation>;

    /// Simulate a latent path and its observations of length `horizon`.
    fn simulate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        horizon: usize,
    ) -> Result<(Vec<Self::State>, Vec<Self::Observation>)> {
        let mut states = Vec::with_capacity(horizon);
        let mut observations = Vec::with_capacity(horizon);
        for t in 0..horizon {
            let x = match states.last() {
                None => self
                    .sample_initial(rng, 1)
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        SmoothingError::InvalidModel("initial law produced no state".into())
                    })?,
                Some(prev) => self.sample_transition(rng, t, prev),
            };
            observations.push(self.sample_observation(rng, t, &x)?);
            states.push(x);
        }
        Ok((states, observations))
    }
}

/// A proper density γ that can be sampled and evaluated in closed form.
pub trait Prior<S>: Sync {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> S;
    fn log_density(&self, x: &S) -> f64;
}

/// Univariate Gaussian prior N(mean, std²).
#[derive(Clone, Debug)]
pub struct ScalarGaussianPrior {
    mean: f64,
    std: f64,
    normal: Normal<f64>,
}

impl ScalarGaussianPrior {
    pub fn new(mean: f64, std: f64) -> Result<Self> {
        if !(std > 0.0 && std.is_finite() && mean.is_finite()) {
            return Err(SmoothingError::InvalidModel(format!(
                "Gaussian prior needs a finite mean and a positive standard deviation, got N({mean}, {std}²)"
            )));
        }
        let normal =
            Normal::new(mean, std).map_err(|e| SmoothingError::InvalidModel(e.to_string()))?;
        Ok(ScalarGaussianPrior { mean, std, normal })
    }
    pub fn mean(&self) -> f64 {
        self.mean
    }
    pub fn std(&self) -> f64 {
        self.std
    }
}

impl Prior<f64> for ScalarGaussianPrior {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.normal.sample(rng)
    }
    fn log_density(&self, x: &f64) -> f64 {
        normal_log_density(*x, self.mean, self.std)
    }
}

/// A model whose initial law is replaced by a prior γ.
///
/// This is the model run by the information filter on reversed data. Every
/// other operation is delegated to the wrapped model.
#[derive(Clone, Debug)]
pub struct InformationModel<M, P> {
    model: M,
    prior: P,
}

impl<M, P> InformationModel<M, P> {
    pub fn new(model: M, prior: P) -> Self {
        InformationModel { model, prior }
    }
    pub fn model(&self) -> &M {
        &self.model
    }
    pub fn prior(&self) -> &P {
        &self.prior
    }
}

impl<M, P> StateSpaceModel for InformationModel<M, P>
where
    M: StateSpaceModel,
    P: Prior<M::State>,
{
    type State = M::State;
    type Observation = M::Observation;

    fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<Self::State> {
        (0..n).map(|_| self.prior.sample(rng)).collect()
    }
    fn sample_transition<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        t: usize,
        x_prev: &Self::State,
    ) -> Self::State {
        self.model.sample_transition(rng, t, x_prev)
    }
    fn log_transition_density(
        &self,
        t: usize,
        x_prev: &Self::State,
        x_next: &Self::State,
    ) -> f64 {
        self.model.log_transition_density(t, x_prev, x_next)
    }
    fn log_observation_density(&self, t: usize, x: &Self::State, y: &Self::Observation) -> f64 {
        self.model.log_observation_density(t, x, y)
    }
    fn upper_bound_log_transition(&self, t: usize) -> f64 {
        self.model.upper_bound_log_transition(t)
    }
    fn sample_observation<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        t: usize,
        x: &Self::State,
    ) -> Result<Self::Observation> {
        self.model.sample_observation(rng, t, x)
    }
}

fn default_mu() -> f64 {
    0.0
}
fn default_phi() -> f64 {
    0.9
}
fn default_sigma() -> f64 {
    0.5
}

/// Parameters of a stationary AR(1) latent process
/// `X_t - mu = phi (X_{t-1} - mu) + sigma U_t`.
///
/// Shared by the model constructors and by the score functional so that both
/// are built from the same values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default = "default_mu")]
    pub mu: f64,
    #[serde(default = "default_phi")]
    pub phi: f64,
    #[serde(default = "default_sigma")]
    pub sigma: f64,
}

impl Default for ModelParameters {
    fn default() -> Self {
        ModelParameters {
            mu: default_mu(),
            phi: default_phi(),
            sigma: default_sigma(),
        }
    }
}

impl ModelParameters {
    pub fn new(mu: f64, phi: f64, sigma: f64) -> Result<Self> {
        let params = ModelParameters { mu, phi, sigma };
        params.validate()?;
        Ok(params)
    }

    /// Check that every density built from these parameters is defined.
    pub fn validate(&self) -> Result<()> {
        if !(self.mu.is_finite() && self.phi.is_finite() && self.sigma.is_finite()) {
            return Err(SmoothingError::InvalidModel(format!(
                "parameters must be finite: {self:?}"
            )));
        }
        if self.sigma <= 0.0 {
            return Err(SmoothingError::InvalidModel(format!(
                "sigma must be positive, got {}",
                self.sigma
            )));
        }
        if self.phi.abs() >= 1.0 {
            return Err(SmoothingError::InvalidModel(format!(
                "|phi| must be below 1 for the stationary law to exist, got {}",
                self.phi
            )));
        }
        Ok(())
    }

    /// Standard deviation of the stationary law, `sigma / sqrt(1 - phi²)`.
    pub fn stationary_std(&self) -> f64 {
        self.sigma / (1.0 - self.phi * self.phi).sqrt()
    }

    #[inline]
    fn predict(&self, x_prev: f64) -> f64 {
        self.mu + self.phi * (x_prev - self.mu)
    }
}

/// Discrete Cox model:
///
/// ```text
/// X_0 ~ N(mu, sigma² / (1 - phi²))
/// X_t = mu + phi (X_{t-1} - mu) + sigma U_t,   U_t ~ N(0, 1)
/// Y_t ~ Poisson(exp(X_t))
/// ```
#[derive(Clone, Debug)]
pub struct DiscreteCox {
    params: ModelParameters,
    initial: Normal<f64>,
    noise: Normal<f64>,
}

impl DiscreteCox {
    pub fn new(params: ModelParameters) -> Result<Self> {
        params.validate()?;
        let initial = Normal::new(params.mu, params.stationary_std())
            .map_err(|e| SmoothingError::InvalidModel(e.to_string()))?;
        let noise =
            Normal::new(0.0, params.sigma).map_err(|e| SmoothingError::InvalidModel(e.to_string()))?;
        Ok(DiscreteCox {
            params,
            initial,
            noise,
        })
    }

    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    /// The stationary law of the latent chain, used as γ by the information filter.
    pub fn stationary_prior(&self) -> Result<ScalarGaussianPrior> {
        ScalarGaussianPrior::new(self.params.mu, self.params.stationary_std())
    }
}

impl StateSpaceModel for DiscreteCox {
    type State = f64;
    type Observation = u64;

    fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.initial.sample(rng)).collect()
    }

    fn sample_transition<R: Rng + ?Sized>(&self, rng: &mut R, _t: usize, x_prev: &f64) -> f64 {
        self.params.predict(*x_prev) + self.noise.sample(rng)
    }

    fn log_transition_density(&self, _t: usize, x_prev: &f64, x_next: &f64) -> f64 {
        normal_log_density(*x_next, self.params.predict(*x_prev), self.params.sigma)
    }

    fn log_observation_density(&self, _t: usize, x: &f64, y: &u64) -> f64 {
        let k = *y as f64;
        k * x - x.exp() - ln_gamma(k + 1.0)
    }

    /// Mode of the Gaussian transition kernel. Time-invariant.
    fn upper_bound_log_transition(&self, _t: usize) -> f64 {
        -0.5 * (LN_2PI + 2.0 * self.params.sigma.ln())
    }

    fn sample_observation<R: Rng + ?Sized>(&self, rng: &mut R, _t: usize, x: &f64) -> Result<u64> {
        let rate = x.exp();
        let poisson = Poisson::new(rate).map_err(|e| {
            SmoothingError::InvalidInput(format!("cannot draw a count with rate {rate}: {e}"))
        })?;
        let count: f64 = poisson.sample(rng);
        Ok(count as u64)
    }
}
