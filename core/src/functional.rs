//! Additive functionals `Σ_{t=0}^{T-2} ψ_t(X_t, X_{t+1})` and their estimates.
use crate::backward::SmoothedTrajectory;
use crate::model::{ModelParameters, StateVector};
use crate::particle::Genealogy;
use std::time::Instant;

/// The per-step term ψ_t of an additive functional.
pub trait AdditiveFunctional<S>: Sync {
    fn evaluate(&self, t: usize, x: &S, x_next: &S) -> f64;
}

impl<S, F> AdditiveFunctional<S> for F
where
    F: Fn(usize, &S, &S) -> f64 + Sync,
{
    fn evaluate(&self, t: usize, x: &S, x_next: &S) -> f64 {
        self(t, x, x_next)
    }
}

/// Score with respect to σ² of an AR(1) latent chain, at the given parameters.
///
/// Each state component is treated as an independent chain with the same
/// parameters. The first term also carries the contribution of the stationary
/// initial law.
#[derive(Clone, Copy, Debug)]
pub struct ScoreFunctional {
    params: ModelParameters,
}

impl ScoreFunctional {
    pub fn new(params: ModelParameters) -> Self {
        ScoreFunctional { params }
    }

    /// d/dσ² of log N(x; mu, σ²/(1 - phi²)).
    pub fn initial_term(&self, x: f64) -> f64 {
        let ModelParameters { mu, phi, sigma } = self.params;
        let s2 = sigma * sigma;
        -0.5 / s2 + 0.5 * (1.0 - phi * phi) / (s2 * s2) * (x - mu).powi(2)
    }

    /// d/dσ² of log N(x_next; mu + phi (x - mu), σ²).
    pub fn transition_term(&self, x: f64, x_next: f64) -> f64 {
        let ModelParameters { mu, phi, sigma } = self.params;
        let s2 = sigma * sigma;
        -0.5 / s2 + 0.5 / (s2 * s2) * ((x_next - mu) - phi * (x - mu)).powi(2)
    }
}

impl<S: StateVector> AdditiveFunctional<S> for ScoreFunctional {
    fn evaluate(&self, t: usize, x: &S, x_next: &S) -> f64 {
        x.components()
            .iter()
            .zip(x_next.components())
            .map(|(&xi, &xn)| match t {
                0 => self.initial_term(xi) + self.transition_term(xi, xn),
                _ => self.transition_term(xi, xn),
            })
            .sum()
    }
}

/// `ψ(x, x') = Σ_k x_k x'_k`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LagProduct;

impl<S: StateVector> AdditiveFunctional<S> for LagProduct {
    fn evaluate(&self, _t: usize, x: &S, x_next: &S) -> f64 {
        x.components()
            .iter()
            .zip(x_next.components())
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// Smoothing estimates of each term `E[ψ_t(X_t, X_{t+1}) | y]`, t = 0..T-2.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdditiveEstimate {
    pub terms: Vec<f64>,
}

impl AdditiveEstimate {
    pub fn new(terms: Vec<f64>) -> Self {
        AdditiveEstimate { terms }
    }

    /// Estimate of the full additive functional. Zero when there are no terms.
    pub fn total(&self) -> f64 {
        self.terms.iter().sum()
    }

    /// Average of the per-step estimates. Zero when there are no terms.
    pub fn mean(&self) -> f64 {
        if self.terms.is_empty() {
            0.0
        } else {
            self.total() / self.terms.len() as f64
        }
    }
}

/// Average ψ_t along each trajectory, then across trajectories, for every t.
pub fn evaluate_trajectories<S, F>(
    func: &F,
    genealogy: &Genealogy<S>,
    trajectories: &[SmoothedTrajectory],
) -> AdditiveEstimate
where
    F: AdditiveFunctional<S> + ?Sized,
{
    let steps = genealogy.len().saturating_sub(1);
    if trajectories.is_empty() {
        return AdditiveEstimate::new(vec![0.0; steps]);
    }
    let m = trajectories.len() as f64;
    let terms = (0..steps)
        .map(|t| {
            let current = &genealogy.systems[t].states;
            let next = &genealogy.systems[t + 1].states;
            trajectories
                .iter()
                .map(|path| {
                    func.evaluate(t, &current[path.indices[t]], &next[path.indices[t + 1]])
                })
                .sum::<f64>()
                / m
        })
        .collect();
    AdditiveEstimate::new(terms)
}

/// Self-normalised average `Σ ω v / Σ ω` accumulated from log-weights.
///
/// Sums are kept relative to the running maximum log-weight, so weights that
/// would underflow individually still combine correctly. Entries with a
/// non-finite log-weight contribute nothing.
#[derive(Clone, Copy, Debug)]
pub struct WeightedMean {
    max_log_weight: f64,
    weight_sum: f64,
    weighted_sum: f64,
}

impl Default for WeightedMean {
    fn default() -> Self {
        WeightedMean {
            max_log_weight: f64::NEG_INFINITY,
            weight_sum: 0.0,
            weighted_sum: 0.0,
        }
    }
}

impl WeightedMean {
    pub fn new() -> Self {
        Self::default()
    }

    fn rescale_to(&mut self, max_log_weight: f64) {
        if max_log_weight > self.max_log_weight {
            if self.weight_sum > 0.0 {
                let factor = (self.max_log_weight - max_log_weight).exp();
                self.weight_sum *= factor;
                self.weighted_sum *= factor;
            }
            self.max_log_weight = max_log_weight;
        }
    }

    pub fn push(&mut self, log_weight: f64, value: f64) {
        if !log_weight.is_finite() {
            return;
        }
        self.rescale_to(log_weight);
        let w = (log_weight - self.max_log_weight).exp();
        self.weight_sum += w;
        self.weighted_sum += w * value;
    }

    pub fn merge(&mut self, other: &WeightedMean) {
        if other.weight_sum <= 0.0 {
            return;
        }
        self.rescale_to(other.max_log_weight);
        let factor = (other.max_log_weight - self.max_log_weight).exp();
        self.weight_sum += factor * other.weight_sum;
        self.weighted_sum += factor * other.weighted_sum;
    }

    /// `log Σ ω`.
    pub fn log_total_weight(&self) -> f64 {
        self.max_log_weight + self.weight_sum.ln()
    }

    /// `None` when no entry carried positive weight.
    pub fn mean(&self) -> Option<f64> {
        (self.weight_sum > 0.0).then(|| self.weighted_sum / self.weight_sum)
    }
}

/// Run `f` and return its output with the elapsed wall-clock time in seconds.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, f64) {
    let start = Instant::now();
    let out = f();
    (out, start.elapsed().as_secs_f64())
}
