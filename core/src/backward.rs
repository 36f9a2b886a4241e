//! Forward filtering, backward sampling (FFBS).
//!
//! Trajectories are drawn backward through the stored forward genealogy by
//! reweighting historical particles with the transition density. Ancestor
//! indices are not used. Each trajectory owns a generator seeded from the
//! caller's, which makes the output identical whether trajectories are traced
//! one after the other or on the rayon pool.
use crate::error::{Result, SmoothingError};
use crate::model::StateSpaceModel;
use crate::particle::{Genealogy, ParticleSystem};
use crate::resampling::{exp_and_normalize, sample_index};
use log::{debug, warn};
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

pub const DEFAULT_MAX_REJECTION_TRIALS: usize = 1000;

/// How each backward step picks the particle at time t.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackwardKernel {
    /// Enumerate all N backward weights, O(N²) per pass.
    Exact,
    /// Accept/reject against the transition bound, O(N) expected per pass.
    Rejection,
}

/// One smoothed path, stored as particle indices into the forward genealogy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmoothedTrajectory {
    pub indices: Vec<usize>,
}

impl SmoothedTrajectory {
    /// Resolve the indices into states.
    pub fn states<'a, S>(&'a self, genealogy: &'a Genealogy<S>) -> impl Iterator<Item = &'a S> {
        self.indices
            .iter()
            .zip(&genealogy.systems)
            .map(|(&i, system)| &system.states[i])
    }
}

/// Counters reported by a backward pass.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BackwardDiagnostics {
    /// Candidate indices proposed by the rejection sampler.
    pub proposals: u64,
    /// Candidates accepted by the rejection sampler.
    pub accepted: u64,
    /// Steps that exhausted the retry cap and were drawn exactly instead.
    pub fallbacks: u64,
}

impl BackwardDiagnostics {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposals == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposals as f64
        }
    }

    fn absorb(&mut self, other: &BackwardDiagnostics) {
        self.proposals += other.proposals;
        self.accepted += other.accepted;
        self.fallbacks += other.fallbacks;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BackwardSampler {
    kernel: BackwardKernel,
    max_rejection_trials: usize,
    parallel: bool,
}

impl BackwardSampler {
    pub fn new(kernel: BackwardKernel) -> Self {
        BackwardSampler {
            kernel,
            max_rejection_trials: DEFAULT_MAX_REJECTION_TRIALS,
            parallel: false,
        }
    }

    pub fn with_max_rejection_trials(mut self, trials: usize) -> Self {
        self.max_rejection_trials = trials;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn kernel(&self) -> BackwardKernel {
        self.kernel
    }

    /// Draw `m` smoothed trajectories from the forward genealogy.
    pub fn sample<M, R>(
        &self,
        model: &M,
        genealogy: &Genealogy<M::State>,
        m: usize,
        rng: &mut R,
    ) -> Result<(Vec<SmoothedTrajectory>, BackwardDiagnostics)>
    where
        M: StateSpaceModel,
        R: Rng + ?Sized,
    {
        if genealogy.is_empty() {
            return Err(SmoothingError::EmptyObservations);
        }
        let proposals = match self.kernel {
            BackwardKernel::Exact => Vec::new(),
            BackwardKernel::Rejection => genealogy
                .systems
                .iter()
                .enumerate()
                .map(|(t, system)| {
                    WeightedIndex::<f64>::new(&system.weights)
                        .map_err(|_| SmoothingError::DegenerateWeights { t })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        let seeds: Vec<u64> = (0..m).map(|_| rng.random()).collect();
        let trace = |seed: &u64| self.trace(model, genealogy, &proposals, *seed);

        let traced: Vec<(SmoothedTrajectory, BackwardDiagnostics)> = if self.parallel {
            seeds.par_iter().map(trace).collect::<Result<_>>()?
        } else {
            seeds.iter().map(trace).collect::<Result<_>>()?
        };

        let mut diagnostics = BackwardDiagnostics::default();
        let mut trajectories = Vec::with_capacity(m);
        for (path, diag) in traced {
            diagnostics.absorb(&diag);
            trajectories.push(path);
        }
        if diagnostics.fallbacks > 0 {
            warn!(
                "backward sampler: {} of {} rejection steps hit the cap of {} trials and were drawn exactly",
                diagnostics.fallbacks,
                m * (genealogy.len() - 1),
                self.max_rejection_trials
            );
        }
        debug!(
            "backward sampler ({:?}): {} trajectories over {} steps, acceptance rate {:.3}",
            self.kernel,
            m,
            genealogy.len(),
            diagnostics.acceptance_rate()
        );
        Ok((trajectories, diagnostics))
    }

    fn trace<M: StateSpaceModel>(
        &self,
        model: &M,
        genealogy: &Genealogy<M::State>,
        proposals: &[WeightedIndex<f64>],
        seed: u64,
    ) -> Result<(SmoothedTrajectory, BackwardDiagnostics)> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut diagnostics = BackwardDiagnostics::default();
        let horizon = genealogy.len();
        let mut indices = vec![0; horizon];

        let last = &genealogy.systems[horizon - 1];
        indices[horizon - 1] = sample_index(&last.weights, &mut rng);

        for t in (0..horizon - 1).rev() {
            let x_next = &genealogy.systems[t + 1].states[indices[t + 1]];
            let system = &genealogy.systems[t];
            indices[t] = match self.kernel {
                BackwardKernel::Exact => exact_draw(model, system, t, x_next, &mut rng)?,
                BackwardKernel::Rejection => {
                    let bound = model.upper_bound_log_transition(t + 1);
                    let mut accepted = None;
                    for _ in 0..self.max_rejection_trials {
                        let candidate = proposals[t].sample(&mut rng);
                        diagnostics.proposals += 1;
                        let lp = model.log_transition_density(t + 1, &system.states[candidate], x_next);
                        if rng.random::<f64>().ln() < lp - bound {
                            accepted = Some(candidate);
                            break;
                        }
                    }
                    match accepted {
                        Some(index) => {
                            diagnostics.accepted += 1;
                            index
                        }
                        None => {
                            diagnostics.fallbacks += 1;
                            exact_draw(model, system, t, x_next, &mut rng)?
                        }
                    }
                }
            };
        }
        Ok((SmoothedTrajectory { indices }, diagnostics))
    }
}

/// Draw from `W_t^n p(x_next | x_t^n)`, normalised over n.
fn exact_draw<M: StateSpaceModel, R: Rng + ?Sized>(
    model: &M,
    system: &ParticleSystem<M::State>,
    t: usize,
    x_next: &M::State,
    rng: &mut R,
) -> Result<usize> {
    let log_weights: Vec<f64> = system
        .weights
        .iter()
        .zip(&system.states)
        .map(|(w, x)| w.ln() + model.log_transition_density(t + 1, x, x_next))
        .collect();
    let weights = exp_and_normalize(&log_weights).ok_or(SmoothingError::DegenerateWeights { t })?;
    Ok(sample_index(&weights, rng))
}
