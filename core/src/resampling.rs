//! Weight arithmetic and resampling schemes.
//!
//! Every routine here takes its random generator from the caller; nothing
//! touches a thread-local or global RNG so that a run is a pure function of
//! its seed.
//!
//! Index selection always walks the cumulative weights with a strict
//! comparison, which guarantees that a particle with zero weight can never be
//! selected, even when floating point round-off leaves the total slightly
//! below one.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Log of the sum of exponentials, stable for large dynamic range.
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp(log_weights: &[f64]) -> f64 {
    let max = log_weights
        .iter()
        .copied()
        .filter(|lw| !lw.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = log_weights
        .iter()
        .filter(|lw| !lw.is_nan())
        .map(|lw| (lw - max).exp())
        .sum();
    max + sum.ln()
}

/// Exponentiate and normalise log-weights so that they sum to one.
///
/// NaN entries are treated as `-inf` (zero weight). Returns `None` when no
/// entry is finite, or when an entry is `+inf`, since no valid probability
/// vector exists in either case.
pub fn exp_and_normalize(log_weights: &[f64]) -> Option<Vec<f64>> {
    let max = log_weights
        .iter()
        .copied()
        .filter(|lw| !lw.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return None;
    }
    let mut weights: Vec<f64> = log_weights
        .iter()
        .map(|lw| if lw.is_nan() { 0.0 } else { (lw - max).exp() })
        .collect();
    let total: f64 = weights.iter().sum();
    for w in &mut weights {
        *w /= total;
    }
    Some(weights)
}

/// Effective sample size `1 / Σ w²` of normalised weights.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_of_squares: f64 = weights.iter().map(|w| w * w).sum();
    if sum_of_squares > 0.0 {
        1.0 / sum_of_squares
    } else {
        0.0
    }
}

/// Draw a single index with probability proportional to `weights`.
pub fn sample_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let target = rng.random::<f64>() * total;
    let mut cumsum = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        cumsum += w;
        if cumsum > target {
            return i;
        }
    }
    last_positive(weights)
}

fn last_positive(weights: &[f64]) -> usize {
    weights.iter().rposition(|&w| w > 0.0).unwrap_or(0)
}

/// Map sorted positions in `[0, 1)` onto indices through the cumulative weights.
fn walk_cdf(weights: &[f64], positions: &[f64]) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let last = last_positive(weights);
    let mut indices = Vec::with_capacity(positions.len());
    let mut i = 0;
    let mut cumsum = weights[0];
    for &position in positions {
        let target = position * total;
        while i < last && cumsum <= target {
            i += 1;
            cumsum += weights[i];
        }
        indices.push(i);
    }
    indices
}

/// Multinomial resampling: `n` i.i.d. draws, returned in index order.
pub fn multinomial_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let mut positions: Vec<f64> = (0..n).map(|_| rng.random::<f64>()).collect();
    positions.sort_by(f64::total_cmp);
    walk_cdf(weights, &positions)
}

/// Systematic resampling: one uniform shared by `n` evenly spaced positions.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let u = rng.random::<f64>();
    let positions: Vec<f64> = (0..n).map(|j| (j as f64 + u) / n as f64).collect();
    walk_cdf(weights, &positions)
}

/// Stratified resampling: one uniform per stratum `[j/n, (j+1)/n)`.
pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let positions: Vec<f64> = (0..n)
        .map(|j| (j as f64 + rng.random::<f64>()) / n as f64)
        .collect();
    walk_cdf(weights, &positions)
}

/// Residual resampling: deterministic `floor(n w)` copies, systematic on the residuals.
pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(n);
    let mut residual = vec![0.0; weights.len()];
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w / total * n as f64;
        let copies = scaled.floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual[i] = scaled - copies as f64;
    }
    // Round-off can push the deterministic part past n.
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        if residual.iter().any(|&r| r > 0.0) {
            indices.extend(systematic_resample(&residual, remaining, rng));
        } else {
            indices.extend(systematic_resample(weights, remaining, rng));
        }
    }
    indices
}

/// Resampling scheme used by the particle filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ResamplingStrategy {
    Multinomial,
    #[default]
    Systematic,
    Stratified,
    Residual,
}

impl ResamplingStrategy {
    /// Draw `n` ancestor indices proportionally to `weights`.
    pub fn resample<R: Rng + ?Sized>(&self, weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        match self {
            ResamplingStrategy::Multinomial => multinomial_resample(weights, n, rng),
            ResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ResamplingStrategy::Residual => residual_resample(weights, n, rng),
        }
    }
}
