//! Two-filter smoothing of additive functionals.
//!
//! The pair `(X_t, X_{t+1})` is approximated by combining forward system `t`
//! with the information filter's system for original time `t + 1`. The
//! information filter runs on reversed data, so that system sits at reversed
//! index `T - 2 - t`. A pair `(i, j)` carries weight
//!
//! ```text
//! W_t^i · W_info^j · p_{t+1}(x_info^j | x_t^i) / γ(x_info^j)
//! ```
//!
//! All products are formed in log space.
use crate::error::{Result, SmoothingError};
use crate::functional::{AdditiveEstimate, AdditiveFunctional, WeightedMean};
use crate::model::{LN_2PI, StateSpaceModel, StateVector};
use crate::particle::{Genealogy, ParticleSystem};
use crate::resampling::{effective_sample_size, exp_and_normalize};
use log::{debug, warn};
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rayon::prelude::*;

/// Auxiliary proposal for the O(N) variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proposal {
    /// Draw pairs from the two filters' own weights.
    Basic,
    /// Tilt each filter's weights towards the other filter's particle cloud
    /// with a moment-matched diagonal Gaussian.
    Gaussian,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TwoFilterKernel {
    /// Every N×N pair, O(N²) per step.
    Exact,
    /// N importance-weighted pairs, O(N) per step.
    Proposal(Proposal),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TwoFilterDiagnostics {
    /// Smallest effective sample size of the pair weights over t (O(N) variant);
    /// `None` for the exact variant or when there are no pairs.
    pub min_pair_ess: Option<f64>,
}

/// Per-coordinate Gaussian fitted to a particle cloud.
///
/// Coordinates with zero (or non-finite) spread are dropped from the density.
#[derive(Clone, Debug)]
struct DiagonalGaussian {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl DiagonalGaussian {
    /// Unweighted moments of the cloud.
    fn fit<S: StateVector>(states: &[S]) -> Self {
        let dim = states.first().map_or(0, |s| s.dim());
        let n = states.len() as f64;
        let mut mean = vec![0.0; dim];
        for s in states {
            for (m, x) in mean.iter_mut().zip(s.components()) {
                *m += x / n;
            }
        }
        let mut var = vec![0.0; dim];
        for s in states {
            for ((v, m), x) in var.iter_mut().zip(&mean).zip(s.components()) {
                *v += (x - m).powi(2) / n;
            }
        }
        DiagonalGaussian {
            mean,
            std: var.into_iter().map(f64::sqrt).collect(),
        }
    }

    fn log_density<S: StateVector>(&self, x: &S) -> f64 {
        self.mean
            .iter()
            .zip(&self.std)
            .zip(x.components())
            .filter(|((_, sd), _)| **sd > 0.0 && sd.is_finite())
            .map(|((m, sd), xi)| {
                let z = (xi - m) / sd;
                -0.5 * (LN_2PI + z * z) - sd.ln()
            })
            .sum()
    }

    fn is_degenerate(&self) -> bool {
        self.std.iter().all(|sd| !(*sd > 0.0 && sd.is_finite()))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TwoFilterSmoother {
    kernel: TwoFilterKernel,
    parallel: bool,
}

impl TwoFilterSmoother {
    pub fn new(kernel: TwoFilterKernel) -> Self {
        TwoFilterSmoother {
            kernel,
            parallel: false,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn kernel(&self) -> TwoFilterKernel {
        self.kernel
    }

    /// Estimate every term `E[ψ_t(X_t, X_{t+1}) | y]` from the two genealogies.
    pub fn estimate<M, F, R>(
        &self,
        model: &M,
        forward: &Genealogy<M::State>,
        info: &Genealogy<M::State>,
        func: &F,
        log_gamma: &(dyn Fn(&M::State) -> f64 + Sync),
        rng: &mut R,
    ) -> Result<(AdditiveEstimate, TwoFilterDiagnostics)>
    where
        M: StateSpaceModel,
        F: AdditiveFunctional<M::State> + ?Sized,
        R: Rng + ?Sized,
    {
        let horizon = forward.len();
        if horizon == 0 {
            return Err(SmoothingError::EmptyObservations);
        }
        if info.len() != horizon {
            return Err(SmoothingError::InvalidInput(format!(
                "forward filter covers {} steps but the information filter covers {}",
                horizon,
                info.len()
            )));
        }

        let mut terms = Vec::with_capacity(horizon - 1);
        let mut min_pair_ess: Option<f64> = None;
        for t in 0..horizon - 1 {
            let fwd = &forward.systems[t];
            let inf = &info.systems[horizon - 2 - t];
            let info_log_weights: Vec<f64> = inf
                .normalized_log_weights()
                .iter()
                .zip(&inf.states)
                .map(|(lw, x)| lw - log_gamma(x))
                .collect();
            let term = match self.kernel {
                TwoFilterKernel::Exact => {
                    self.exact_term(model, t, fwd, inf, &info_log_weights, func)?
                }
                TwoFilterKernel::Proposal(proposal) => {
                    let (modif_fwd, modif_info) = match proposal {
                        Proposal::Basic => (None, None),
                        Proposal::Gaussian => {
                            // information particles at original time t, forward particles at t + 1
                            let info_now = DiagonalGaussian::fit(&info.systems[horizon - 1 - t].states);
                            let fwd_next = DiagonalGaussian::fit(&forward.systems[t + 1].states);
                            if info_now.is_degenerate() || fwd_next.is_degenerate() {
                                warn!(
                                    "two-filter proposal at t = {t}: particle cloud has no spread, tilt skipped"
                                );
                            }
                            (
                                Some(fwd.states.iter().map(|x| info_now.log_density(x)).collect::<Vec<f64>>()),
                                Some(inf.states.iter().map(|x| fwd_next.log_density(x)).collect::<Vec<f64>>()),
                            )
                        }
                    };
                    let (term, ess) = proposal_term(
                        model,
                        t,
                        fwd,
                        inf,
                        &info_log_weights,
                        modif_fwd.as_deref(),
                        modif_info.as_deref(),
                        func,
                        rng,
                    )?;
                    min_pair_ess = Some(min_pair_ess.map_or(ess, |m| m.min(ess)));
                    term
                }
            };
            terms.push(term);
        }

        debug!(
            "two-filter smoother ({:?}): {} terms, min pair ESS {:?}",
            self.kernel,
            terms.len(),
            min_pair_ess
        );
        Ok((
            AdditiveEstimate::new(terms),
            TwoFilterDiagnostics { min_pair_ess },
        ))
    }

    /// Stream the N×N pair weights one forward particle (row) at a time.
    ///
    /// Rows may be evaluated on the rayon pool; they are merged in row order so
    /// the result does not depend on scheduling.
    fn exact_term<M, F>(
        &self,
        model: &M,
        t: usize,
        fwd: &ParticleSystem<M::State>,
        inf: &ParticleSystem<M::State>,
        info_log_weights: &[f64],
        func: &F,
    ) -> Result<f64>
    where
        M: StateSpaceModel,
        F: AdditiveFunctional<M::State> + ?Sized,
    {
        let fwd_log_weights = fwd.normalized_log_weights();
        let row = |i: usize| {
            let mut acc = WeightedMean::new();
            let lw_i = fwd_log_weights[i];
            if !lw_i.is_finite() {
                return acc;
            }
            let x = &fwd.states[i];
            for (x_info, lw_j) in inf.states.iter().zip(info_log_weights) {
                let lw = lw_i + lw_j + model.log_transition_density(t + 1, x, x_info);
                if lw.is_finite() {
                    acc.push(lw, func.evaluate(t, x, x_info));
                }
            }
            acc
        };
        let rows: Vec<WeightedMean> = if self.parallel {
            (0..fwd.len()).into_par_iter().map(row).collect()
        } else {
            (0..fwd.len()).map(row).collect()
        };
        let mut total = WeightedMean::new();
        for r in &rows {
            total.merge(r);
        }
        total.mean().ok_or(SmoothingError::DegenerateWeights { t })
    }
}

/// O(N) two-filter term from i.i.d. pairs `I ~ W_fwd·e^modif_fwd`,
/// `J ~ W_info·e^modif_info`, corrected by the pair density.
#[allow(clippy::too_many_arguments)]
fn proposal_term<M, F, R>(
    model: &M,
    t: usize,
    fwd: &ParticleSystem<M::State>,
    inf: &ParticleSystem<M::State>,
    info_log_weights: &[f64],
    modif_fwd: Option<&[f64]>,
    modif_info: Option<&[f64]>,
    func: &F,
    rng: &mut R,
) -> Result<(f64, f64)>
where
    M: StateSpaceModel,
    F: AdditiveFunctional<M::State> + ?Sized,
    R: Rng + ?Sized,
{
    let n = fwd.len();
    let tilt = |base: &[f64], modif: Option<&[f64]>| -> Vec<f64> {
        match modif {
            Some(m) => base.iter().zip(m).map(|(b, m)| b + m).collect(),
            None => base.to_vec(),
        }
    };
    let fwd_proposal = exp_and_normalize(&tilt(&fwd.normalized_log_weights(), modif_fwd))
        .ok_or(SmoothingError::DegenerateWeights { t })?;
    let info_proposal = exp_and_normalize(&tilt(info_log_weights, modif_info))
        .ok_or(SmoothingError::DegenerateWeights { t })?;
    let fwd_index = WeightedIndex::<f64>::new(&fwd_proposal)
        .map_err(|_| SmoothingError::DegenerateWeights { t })?;
    let info_index = WeightedIndex::<f64>::new(&info_proposal)
        .map_err(|_| SmoothingError::DegenerateWeights { t })?;

    let mut pairs = Vec::with_capacity(n);
    let mut log_omega = Vec::with_capacity(n);
    for _ in 0..n {
        let i = fwd_index.sample(rng);
        let j = info_index.sample(rng);
        let mut lw = model.log_transition_density(t + 1, &fwd.states[i], &inf.states[j]);
        if let Some(m) = modif_fwd {
            lw -= m[i];
        }
        if let Some(m) = modif_info {
            lw -= m[j];
        }
        pairs.push((i, j));
        log_omega.push(lw);
    }
    let omega = exp_and_normalize(&log_omega).ok_or(SmoothingError::DegenerateWeights { t })?;
    let term: f64 = pairs
        .iter()
        .zip(&omega)
        .filter(|(_, w)| **w > 0.0)
        .map(|(&(i, j), w)| w * func.evaluate(t, &fwd.states[i], &inf.states[j]))
        .sum();
    Ok((term, effective_sample_size(&omega)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiscreteCox, ModelParameters, Prior};
    use crate::particle::ParticleFilter;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct Setup {
        model: DiscreteCox,
        forward: Genealogy<f64>,
        info: Genealogy<f64>,
    }

    fn setup(horizon: usize, n: usize) -> Setup {
        let model = DiscreteCox::new(ModelParameters::default()).unwrap();
        let (_, data) = model
            .simulate(&mut StdRng::seed_from_u64(31), horizon)
            .unwrap();
        let reversed: Vec<u64> = data.iter().rev().copied().collect();
        let filter = ParticleFilter::default();
        let mut rng = StdRng::seed_from_u64(32);
        let forward = filter.run(&model, &data, n, &mut rng).unwrap().genealogy;
        let info = filter.run(&model, &reversed, n, &mut rng).unwrap().genealogy;
        Setup {
            model,
            forward,
            info,
        }
    }

    #[test]
    fn exact_parallel_rows_are_bit_identical() {
        let s = setup(10, 80);
        let prior = s.model.stationary_prior().unwrap();
        let log_gamma = |x: &f64| prior.log_density(x);
        let psi = |_t: usize, x: &f64, xn: &f64| x * xn;
        let smoother = TwoFilterSmoother::new(TwoFilterKernel::Exact);
        let mut rng = StdRng::seed_from_u64(0);
        let (seq, _) = smoother
            .estimate(&s.model, &s.forward, &s.info, &psi, &log_gamma, &mut rng)
            .unwrap();
        let (par, diag) = smoother
            .with_parallel(true)
            .estimate(&s.model, &s.forward, &s.info, &psi, &log_gamma, &mut rng)
            .unwrap();
        assert_eq!(seq, par);
        assert_eq!(seq.terms.len(), 9);
        assert!(diag.min_pair_ess.is_none());
    }

    #[test]
    fn constant_functional_is_reproduced_exactly() {
        let s = setup(8, 50);
        let prior = s.model.stationary_prior().unwrap();
        let log_gamma = |x: &f64| prior.log_density(x);
        let psi = |_t: usize, _x: &f64, _xn: &f64| 2.5;
        for kernel in [
            TwoFilterKernel::Exact,
            TwoFilterKernel::Proposal(Proposal::Basic),
            TwoFilterKernel::Proposal(Proposal::Gaussian),
        ] {
            let (est, _) = TwoFilterSmoother::new(kernel)
                .estimate(
                    &s.model,
                    &s.forward,
                    &s.info,
                    &psi,
                    &log_gamma,
                    &mut StdRng::seed_from_u64(1),
                )
                .unwrap();
            for term in &est.terms {
                assert_approx_eq!(*term, 2.5, 1e-12);
            }
        }
    }

    #[test]
    fn proposal_reports_pair_ess() {
        let s = setup(6, 40);
        let prior = s.model.stationary_prior().unwrap();
        let log_gamma = |x: &f64| prior.log_density(x);
        let psi = |_t: usize, x: &f64, _xn: &f64| *x;
        let (_, diag) = TwoFilterSmoother::new(TwoFilterKernel::Proposal(Proposal::Gaussian))
            .estimate(
                &s.model,
                &s.forward,
                &s.info,
                &psi,
                &log_gamma,
                &mut StdRng::seed_from_u64(2),
            )
            .unwrap();
        let ess = diag.min_pair_ess.unwrap();
        assert!(ess >= 1.0 - 1e-9 && ess <= 40.0 + 1e-9);
    }

    #[test]
    fn single_step_has_no_terms_and_lengths_must_match() {
        let s = setup(1, 10);
        let psi = |_t: usize, x: &f64, xn: &f64| x + xn;
        let log_gamma = |_x: &f64| 0.0;
        let (est, _) = TwoFilterSmoother::new(TwoFilterKernel::Exact)
            .estimate(
                &s.model,
                &s.forward,
                &s.info,
                &psi,
                &log_gamma,
                &mut StdRng::seed_from_u64(3),
            )
            .unwrap();
        assert!(est.terms.is_empty());
        assert_eq!(est.total(), 0.0);

        let longer = setup(3, 10);
        let mismatch = TwoFilterSmoother::new(TwoFilterKernel::Exact).estimate(
            &s.model,
            &s.forward,
            &longer.info,
            &psi,
            &log_gamma,
            &mut StdRng::seed_from_u64(3),
        );
        assert!(matches!(mismatch, Err(SmoothingError::InvalidInput(_))));
    }

    #[test]
    fn diagonal_gaussian_ignores_flat_coordinates() {
        let cloud = vec![1.0, 1.0, 1.0];
        let fit = DiagonalGaussian::fit(cloud.as_slice());
        assert!(fit.is_degenerate());
        assert_eq!(fit.log_density(&5.0_f64), 0.0);

        let cloud = vec![-1.0, 1.0];
        let fit = DiagonalGaussian::fit(cloud.as_slice());
        assert_approx_eq!(fit.mean[0], 0.0, 1e-15);
        assert_approx_eq!(fit.std[0], 1.0, 1e-15);
        assert_approx_eq!(fit.log_density(&0.0_f64), -0.5 * LN_2PI, 1e-12);
    }
}
