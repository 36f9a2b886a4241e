//! Bootstrap particle filter with a fully retained genealogy.
//!
//! Every particle system is kept after the pass (states, weights, and ancestor
//! indices), since the backward samplers and the two-filter smoother revisit
//! arbitrary historical particles. The same routine runs the information filter
//! when handed reversed observations and a model whose initial law is γ.
use crate::error::{Result, SmoothingError};
use crate::model::StateSpaceModel;
use crate::resampling::{
    ResamplingStrategy, effective_sample_size, exp_and_normalize, log_sum_exp,
};
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_ess_threshold() -> f64 {
    1.0
}

/// When and how the filter resamples.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub resampling_strategy: ResamplingStrategy,
    /// Resample when `ESS < ess_threshold * N`; `1.0` resamples at every step.
    #[serde(default = "default_ess_threshold")]
    pub ess_threshold: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            resampling_strategy: ResamplingStrategy::default(),
            ess_threshold: default_ess_threshold(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.ess_threshold > 0.0 && self.ess_threshold <= 1.0) {
            return Err(SmoothingError::InvalidInput(format!(
                "ess_threshold must lie in (0, 1], got {}",
                self.ess_threshold
            )));
        }
        Ok(())
    }

    fn should_resample(&self, ess: f64, n: usize) -> bool {
        self.ess_threshold >= 1.0 || ess < self.ess_threshold * n as f64
    }
}

/// Weighted particle population at one time step.
#[derive(Clone, Debug)]
pub struct ParticleSystem<S> {
    pub states: Vec<S>,
    /// Unnormalised log-weights. NaN likelihoods are stored as `-inf`.
    pub log_weights: Vec<f64>,
    /// Normalised weights, summing to one.
    pub weights: Vec<f64>,
    /// Index of each particle's parent in the previous system. Identity at t = 0.
    pub ancestors: Vec<usize>,
    pub ess: f64,
    /// Whether the parents were drawn by resampling the previous system.
    pub resampled: bool,
}

impl<S> ParticleSystem<S> {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Normalised log-weights `log W^n`, computed without going through `exp`.
    pub fn normalized_log_weights(&self) -> Vec<f64> {
        let total = log_sum_exp(&self.log_weights);
        self.log_weights.iter().map(|lw| lw - total).collect()
    }
}

/// Every particle system of a filter pass, indexed by time.
#[derive(Clone, Debug)]
pub struct Genealogy<S> {
    pub systems: Vec<ParticleSystem<S>>,
}

impl<S> Genealogy<S> {
    /// Number of time steps.
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn n_particles(&self) -> usize {
        self.systems.first().map_or(0, |s| s.len())
    }

    pub fn last(&self) -> Option<&ParticleSystem<S>> {
        self.systems.last()
    }

    /// Trace the ancestry of final particle `n` back to t = 0.
    ///
    /// This is the forward (genealogy tracking) path; the smoothers do not use it.
    pub fn ancestral_path(&self, n: usize) -> Vec<usize> {
        let mut path = vec![0; self.len()];
        let mut index = n;
        for (t, system) in self.systems.iter().enumerate().rev() {
            path[t] = index;
            index = system.ancestors[index];
        }
        path
    }
}

/// Result of a filter pass.
#[derive(Clone, Debug)]
pub struct FilterOutput<S> {
    pub genealogy: Genealogy<S>,
    pub log_likelihood: f64,
}

/// Bootstrap particle filter.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParticleFilter {
    config: FilterConfig,
}

impl ParticleFilter {
    pub fn new(config: FilterConfig) -> Self {
        ParticleFilter { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Run the filter over `observations` with `n` particles.
    ///
    /// Propagation uses the model's transition only (no look-ahead at the
    /// current observation). The log-likelihood accumulates
    /// `log Σ_n W_{t-1}^n G_t^n` at every step.
    pub fn run<M, R>(
        &self,
        model: &M,
        observations: &[M::Observation],
        n: usize,
        rng: &mut R,
    ) -> Result<FilterOutput<M::State>>
    where
        M: StateSpaceModel,
        R: Rng + ?Sized,
    {
        if n == 0 {
            return Err(SmoothingError::InvalidParticleCount(n));
        }
        if observations.is_empty() {
            return Err(SmoothingError::EmptyObservations);
        }
        self.config.validate()?;

        let mut systems: Vec<ParticleSystem<M::State>> = Vec::with_capacity(observations.len());
        let mut log_likelihood = 0.0;
        let mut resample_count = 0usize;

        for (t, y) in observations.iter().enumerate() {
            let (states, ancestors, carried, resampled) = match systems.last() {
                None => (
                    model.sample_initial(rng, n),
                    (0..n).collect::<Vec<_>>(),
                    vec![0.0; n],
                    false,
                ),
                Some(prev) => {
                    let (ancestors, carried, resampled) =
                        if self.config.should_resample(prev.ess, n) {
                            let a = self
                                .config
                                .resampling_strategy
                                .resample(&prev.weights, n, rng);
                            (a, vec![0.0; n], true)
                        } else {
                            (
                                (0..n).collect::<Vec<_>>(),
                                prev.normalized_log_weights(),
                                false,
                            )
                        };
                    let states = ancestors
                        .iter()
                        .map(|&a| model.sample_transition(rng, t, &prev.states[a]))
                        .collect();
                    (states, ancestors, carried, resampled)
                }
            };
            if states.len() != n {
                return Err(SmoothingError::InvalidModel(format!(
                    "initial law returned {} states, expected {n}",
                    states.len()
                )));
            }

            let log_g: Vec<f64> = states
                .iter()
                .map(|x| {
                    let lg = model.log_observation_density(t, x, y);
                    if lg.is_nan() { f64::NEG_INFINITY } else { lg }
                })
                .collect();
            let log_weights: Vec<f64> = carried.iter().zip(&log_g).map(|(c, g)| c + g).collect();
            let weights =
                exp_and_normalize(&log_weights).ok_or(SmoothingError::FilterCollapse { t })?;
            // log Σ W_{t-1} G_t, with W_{t-1} uniform after resampling
            log_likelihood += log_sum_exp(&log_weights) - log_sum_exp(&carried);
            let ess = effective_sample_size(&weights);
            if resampled {
                resample_count += 1;
            }
            systems.push(ParticleSystem {
                states,
                log_weights,
                weights,
                ancestors,
                ess,
                resampled,
            });
        }

        debug!(
            "particle filter: T = {}, N = {}, resampled {} times, log-likelihood = {:.4}",
            observations.len(),
            n,
            resample_count,
            log_likelihood
        );
        Ok(FilterOutput {
            genealogy: Genealogy { systems },
            log_likelihood,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiscreteCox, ModelParameters};
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn setup(horizon: usize) -> (DiscreteCox, Vec<u64>) {
        let model = DiscreteCox::new(ModelParameters::default()).unwrap();
        let (_, data) = model
            .simulate(&mut StdRng::seed_from_u64(100), horizon)
            .unwrap();
        (model, data)
    }

    #[test]
    fn weights_sum_to_one_at_every_step() {
        let (model, data) = setup(30);
        let filter = ParticleFilter::default();
        let out = filter
            .run(&model, &data, 200, &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert_eq!(out.genealogy.len(), 30);
        assert_eq!(out.genealogy.n_particles(), 200);
        for system in &out.genealogy.systems {
            assert_approx_eq!(system.weights.iter().sum::<f64>(), 1.0, 1e-9);
            assert!(system.weights.iter().all(|&w| w >= 0.0));
            assert!(system.ess >= 1.0 - 1e-9 && system.ess <= 200.0 + 1e-9);
        }
        assert!(out.log_likelihood.is_finite());
    }

    #[test]
    fn default_filter_resamples_every_step() {
        let (model, data) = setup(10);
        let out = ParticleFilter::default()
            .run(&model, &data, 50, &mut StdRng::seed_from_u64(2))
            .unwrap();
        assert!(!out.genealogy.systems[0].resampled);
        assert!(out.genealogy.systems[1..].iter().all(|s| s.resampled));
    }

    #[test]
    fn adaptive_filter_carries_weights() {
        let (model, data) = setup(20);
        let config = FilterConfig {
            resampling_strategy: ResamplingStrategy::Stratified,
            ess_threshold: 1e-6,
        };
        let out = ParticleFilter::new(config)
            .run(&model, &data, 50, &mut StdRng::seed_from_u64(3))
            .unwrap();
        // ESS never drops below 5e-5 particles, so the filter never resamples
        assert!(out.genealogy.systems.iter().all(|s| !s.resampled));
        assert!(
            out.genealogy.systems[1]
                .ancestors
                .iter()
                .enumerate()
                .all(|(i, &a)| i == a)
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        let (model, data) = setup(5);
        let filter = ParticleFilter::default();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            filter.run(&model, &data, 0, &mut rng),
            Err(SmoothingError::InvalidParticleCount(0))
        ));
        assert!(matches!(
            filter.run(&model, &[], 10, &mut rng),
            Err(SmoothingError::EmptyObservations)
        ));
        let bad = ParticleFilter::new(FilterConfig {
            ess_threshold: 0.0,
            ..FilterConfig::default()
        });
        assert!(bad.run(&model, &data, 10, &mut rng).is_err());
    }

    /// Observations other than zero are impossible under this model.
    struct ZeroOnly;

    impl StateSpaceModel for ZeroOnly {
        type State = f64;
        type Observation = u64;

        fn sample_initial<R: Rng + ?Sized>(&self, _rng: &mut R, n: usize) -> Vec<f64> {
            vec![0.0; n]
        }
        fn sample_transition<R: Rng + ?Sized>(&self, _rng: &mut R, _t: usize, x: &f64) -> f64 {
            *x
        }
        fn log_transition_density(&self, _t: usize, _x: &f64, _xn: &f64) -> f64 {
            0.0
        }
        fn log_observation_density(&self, _t: usize, _x: &f64, y: &u64) -> f64 {
            if *y == 0 { 0.0 } else { f64::NEG_INFINITY }
        }
        fn upper_bound_log_transition(&self, _t: usize) -> f64 {
            0.0
        }
        fn sample_observation<R: Rng + ?Sized>(&self, _rng: &mut R, _t: usize, _x: &f64) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn reports_collapse_when_every_likelihood_vanishes() {
        let data = vec![0, 0, 3, 0];
        let result =
            ParticleFilter::default().run(&ZeroOnly, &data, 20, &mut StdRng::seed_from_u64(4));
        assert!(matches!(result, Err(SmoothingError::FilterCollapse { t: 2 })));
    }

    #[test]
    fn log_likelihood_is_exact_for_a_deterministic_model() {
        let out = ParticleFilter::default()
            .run(&ZeroOnly, &[0, 0, 0], 8, &mut StdRng::seed_from_u64(6))
            .unwrap();
        assert_approx_eq!(out.log_likelihood, 0.0, 1e-12);
    }

    #[test]
    fn single_particle_and_ancestral_path() {
        let (model, data) = setup(6);
        let out = ParticleFilter::default()
            .run(&model, &data, 1, &mut StdRng::seed_from_u64(5))
            .unwrap();
        assert_eq!(out.genealogy.ancestral_path(0), vec![0; 6]);
        for system in &out.genealogy.systems {
            assert_eq!(system.weights, vec![1.0]);
        }
    }

    #[test]
    fn same_seed_same_genealogy() {
        let (model, data) = setup(15);
        let filter = ParticleFilter::default();
        let a = filter
            .run(&model, &data, 64, &mut StdRng::seed_from_u64(8))
            .unwrap();
        let b = filter
            .run(&model, &data, 64, &mut StdRng::seed_from_u64(8))
            .unwrap();
        assert_eq!(a.log_likelihood, b.log_likelihood);
        for (sa, sb) in a.genealogy.systems.iter().zip(&b.genealogy.systems) {
            assert_eq!(sa.states, sb.states);
            assert_eq!(sa.ancestors, sb.ancestors);
        }
    }
}
