//! Method selection and the per-run smoothing worker.
//!
//! A run is a pure function of `(method, N, seed)` and the borrowed problem:
//! it seeds its own generator, runs the forward filter (and the information
//! filter when the method needs one), applies the selected smoother, and
//! returns a [`SmoothingResult`] record.
use crate::backward::{BackwardDiagnostics, BackwardKernel, BackwardSampler};
use crate::error::{Result, SmoothingError};
use crate::functional::{AdditiveEstimate, AdditiveFunctional, evaluate_trajectories, timed};
use crate::model::StateSpaceModel;
use crate::particle::{FilterConfig, Genealogy, ParticleFilter};
use crate::two_filter::{Proposal, TwoFilterDiagnostics, TwoFilterKernel, TwoFilterSmoother};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of smoothing algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum SmoothingMethod {
    /// FFBS with rejection-based backward draws.
    #[serde(rename = "FFBS_ON")]
    #[cfg_attr(feature = "clap", value(name = "FFBS_ON"))]
    FfbsOn,
    /// FFBS with exact backward weights.
    #[serde(rename = "FFBS_ON2")]
    #[cfg_attr(feature = "clap", value(name = "FFBS_ON2"))]
    FfbsOn2,
    /// Two-filter smoothing, O(N) with the filters' own weights as proposal.
    #[serde(rename = "two-filter_ON")]
    #[cfg_attr(feature = "clap", value(name = "two-filter_ON"))]
    TwoFilterOn,
    /// Two-filter smoothing, O(N) with the Gaussian-tilted proposal.
    #[serde(rename = "two-filter_ON_prop")]
    #[cfg_attr(feature = "clap", value(name = "two-filter_ON_prop"))]
    TwoFilterOnProp,
    /// Two-filter smoothing over all N×N pairs.
    #[serde(rename = "two-filter_ON2")]
    #[cfg_attr(feature = "clap", value(name = "two-filter_ON2"))]
    TwoFilterOn2,
}

impl SmoothingMethod {
    pub const ALL: [SmoothingMethod; 5] = [
        SmoothingMethod::FfbsOn,
        SmoothingMethod::FfbsOn2,
        SmoothingMethod::TwoFilterOn,
        SmoothingMethod::TwoFilterOnProp,
        SmoothingMethod::TwoFilterOn2,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SmoothingMethod::FfbsOn => "FFBS_ON",
            SmoothingMethod::FfbsOn2 => "FFBS_ON2",
            SmoothingMethod::TwoFilterOn => "two-filter_ON",
            SmoothingMethod::TwoFilterOnProp => "two-filter_ON_prop",
            SmoothingMethod::TwoFilterOn2 => "two-filter_ON2",
        }
    }

    pub fn needs_information_filter(&self) -> bool {
        !matches!(self, SmoothingMethod::FfbsOn | SmoothingMethod::FfbsOn2)
    }
}

impl fmt::Display for SmoothingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SmoothingMethod {
    type Err = SmoothingError;

    fn from_str(s: &str) -> Result<Self> {
        SmoothingMethod::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| SmoothingError::UnknownMethod(s.to_string()))
    }
}

fn default_max_rejection_trials() -> usize {
    crate::backward::DEFAULT_MAX_REJECTION_TRIALS
}

/// Tuning shared by every run of a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmoothingOptions {
    /// Proposals per backward step before the rejection sampler draws exactly.
    #[serde(default = "default_max_rejection_trials")]
    pub max_rejection_trials: usize,
    /// Trace backward trajectories and two-filter rows on the rayon pool.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub filter: FilterConfig,
}

impl Default for SmoothingOptions {
    fn default() -> Self {
        SmoothingOptions {
            max_rejection_trials: default_max_rejection_trials(),
            parallel: false,
            filter: FilterConfig::default(),
        }
    }
}

/// Everything a run borrows: the two models, the data, ψ, and log γ.
pub struct SmoothingProblem<'a, M, I, F>
where
    M: StateSpaceModel,
    F: ?Sized,
{
    pub forward_model: &'a M,
    /// Model run by the information filter on reversed data; its initial law should be γ.
    pub info_model: &'a I,
    pub data: &'a [M::Observation],
    pub additive_func: &'a F,
    pub log_gamma: &'a (dyn Fn(&M::State) -> f64 + Sync),
}

impl<'a, M, I, F> SmoothingProblem<'a, M, I, F>
where
    M: StateSpaceModel,
    I: StateSpaceModel<State = M::State, Observation = M::Observation>,
    F: AdditiveFunctional<M::State> + ?Sized,
{
    pub fn new(
        forward_model: &'a M,
        info_model: &'a I,
        data: &'a [M::Observation],
        additive_func: &'a F,
        log_gamma: &'a (dyn Fn(&M::State) -> f64 + Sync),
    ) -> Self {
        SmoothingProblem {
            forward_model,
            info_model,
            data,
            additive_func,
            log_gamma,
        }
    }
}

/// Diagnostics of whichever smoother ran.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SmoothingDiagnostics {
    Backward(BackwardDiagnostics),
    TwoFilter(TwoFilterDiagnostics),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SmoothingOutput {
    pub estimate: AdditiveEstimate,
    pub diagnostics: SmoothingDiagnostics,
}

/// A smoothing algorithm run on already-filtered genealogies.
pub trait SmoothingAlgorithm {
    fn needs_information_filter(&self) -> bool;

    fn run<M, I, F, R>(
        &self,
        problem: &SmoothingProblem<'_, M, I, F>,
        forward: &Genealogy<M::State>,
        info: Option<&Genealogy<M::State>>,
        rng: &mut R,
    ) -> Result<SmoothingOutput>
    where
        M: StateSpaceModel,
        I: StateSpaceModel<State = M::State, Observation = M::Observation>,
        F: AdditiveFunctional<M::State> + ?Sized,
        R: Rng + ?Sized;
}

impl SmoothingAlgorithm for BackwardSampler {
    fn needs_information_filter(&self) -> bool {
        false
    }

    fn run<M, I, F, R>(
        &self,
        problem: &SmoothingProblem<'_, M, I, F>,
        forward: &Genealogy<M::State>,
        _info: Option<&Genealogy<M::State>>,
        rng: &mut R,
    ) -> Result<SmoothingOutput>
    where
        M: StateSpaceModel,
        I: StateSpaceModel<State = M::State, Observation = M::Observation>,
        F: AdditiveFunctional<M::State> + ?Sized,
        R: Rng + ?Sized,
    {
        let m = forward.n_particles();
        let (trajectories, diagnostics) = self.sample(problem.forward_model, forward, m, rng)?;
        Ok(SmoothingOutput {
            estimate: evaluate_trajectories(problem.additive_func, forward, &trajectories),
            diagnostics: SmoothingDiagnostics::Backward(diagnostics),
        })
    }
}

impl SmoothingAlgorithm for TwoFilterSmoother {
    fn needs_information_filter(&self) -> bool {
        true
    }

    fn run<M, I, F, R>(
        &self,
        problem: &SmoothingProblem<'_, M, I, F>,
        forward: &Genealogy<M::State>,
        info: Option<&Genealogy<M::State>>,
        rng: &mut R,
    ) -> Result<SmoothingOutput>
    where
        M: StateSpaceModel,
        I: StateSpaceModel<State = M::State, Observation = M::Observation>,
        F: AdditiveFunctional<M::State> + ?Sized,
        R: Rng + ?Sized,
    {
        let info = info.ok_or_else(|| {
            SmoothingError::InvalidInput("two-filter smoothing needs an information filter".into())
        })?;
        let (estimate, diagnostics) = self.estimate(
            problem.forward_model,
            forward,
            info,
            problem.additive_func,
            problem.log_gamma,
            rng,
        )?;
        Ok(SmoothingOutput {
            estimate,
            diagnostics: SmoothingDiagnostics::TwoFilter(diagnostics),
        })
    }
}

/// A configured smoother for one [`SmoothingMethod`].
#[derive(Clone, Copy, Debug)]
pub enum Smoother {
    Backward(BackwardSampler),
    TwoFilter(TwoFilterSmoother),
}

impl Smoother {
    pub fn new(method: SmoothingMethod, options: &SmoothingOptions) -> Self {
        let backward = |kernel| {
            Smoother::Backward(
                BackwardSampler::new(kernel)
                    .with_max_rejection_trials(options.max_rejection_trials)
                    .with_parallel(options.parallel),
            )
        };
        let two_filter =
            |kernel| Smoother::TwoFilter(TwoFilterSmoother::new(kernel).with_parallel(options.parallel));
        match method {
            SmoothingMethod::FfbsOn => backward(BackwardKernel::Rejection),
            SmoothingMethod::FfbsOn2 => backward(BackwardKernel::Exact),
            SmoothingMethod::TwoFilterOn => two_filter(TwoFilterKernel::Proposal(Proposal::Basic)),
            SmoothingMethod::TwoFilterOnProp => {
                two_filter(TwoFilterKernel::Proposal(Proposal::Gaussian))
            }
            SmoothingMethod::TwoFilterOn2 => two_filter(TwoFilterKernel::Exact),
        }
    }
}

impl SmoothingAlgorithm for Smoother {
    fn needs_information_filter(&self) -> bool {
        match self {
            Smoother::Backward(s) => s.needs_information_filter(),
            Smoother::TwoFilter(s) => s.needs_information_filter(),
        }
    }

    fn run<M, I, F, R>(
        &self,
        problem: &SmoothingProblem<'_, M, I, F>,
        forward: &Genealogy<M::State>,
        info: Option<&Genealogy<M::State>>,
        rng: &mut R,
    ) -> Result<SmoothingOutput>
    where
        M: StateSpaceModel,
        I: StateSpaceModel<State = M::State, Observation = M::Observation>,
        F: AdditiveFunctional<M::State> + ?Sized,
        R: Rng + ?Sized,
    {
        match self {
            Smoother::Backward(s) => s.run(problem, forward, info, rng),
            Smoother::TwoFilter(s) => s.run(problem, forward, info, rng),
        }
    }
}

/// One `(method, N, run)` evaluation, as handed to the experiment harness.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmoothingResult {
    pub method: SmoothingMethod,
    #[serde(rename = "N")]
    pub n: usize,
    pub run: usize,
    pub seed: u64,
    /// Estimate of `Σ_t E[ψ_t(X_t, X_{t+1}) | y]`.
    pub estimate: f64,
    /// Average of the per-step terms.
    pub mean_term: f64,
    /// Wall-clock seconds for the filter pass(es) plus smoothing.
    pub cpu_time_s: f64,
    /// Backward steps that exhausted the rejection cap; zero for two-filter methods.
    #[serde(default)]
    pub rejection_fallbacks: u64,
    /// Smallest pair ESS over t; only the O(N) two-filter methods report one.
    #[serde(default)]
    pub min_pair_ess: Option<f64>,
}

/// Run one smoothing evaluation from scratch.
///
/// Rejects `n == 0` before doing any work. Every random draw comes from a
/// `StdRng` seeded with `seed`, so the same arguments always give the same
/// estimate.
pub fn smoothing_worker<M, I, F>(
    method: SmoothingMethod,
    n: usize,
    problem: &SmoothingProblem<'_, M, I, F>,
    seed: u64,
    options: &SmoothingOptions,
) -> Result<SmoothingResult>
where
    M: StateSpaceModel,
    I: StateSpaceModel<State = M::State, Observation = M::Observation>,
    F: AdditiveFunctional<M::State> + ?Sized,
{
    if n == 0 {
        return Err(SmoothingError::InvalidParticleCount(n));
    }
    let smoother = Smoother::new(method, options);
    let filter = ParticleFilter::new(options.filter);

    let (output, cpu_time_s) = timed(|| -> Result<SmoothingOutput> {
        let mut rng = StdRng::seed_from_u64(seed);
        let forward = filter.run(problem.forward_model, problem.data, n, &mut rng)?;
        let info = if smoother.needs_information_filter() {
            let reversed: Vec<M::Observation> = problem.data.iter().rev().cloned().collect();
            Some(filter.run(problem.info_model, &reversed, n, &mut rng)?)
        } else {
            None
        };
        smoother.run(
            problem,
            &forward.genealogy,
            info.as_ref().map(|o| &o.genealogy),
            &mut rng,
        )
    });
    let output = output?;
    let (rejection_fallbacks, min_pair_ess) = match output.diagnostics {
        SmoothingDiagnostics::Backward(d) => (d.fallbacks, None),
        SmoothingDiagnostics::TwoFilter(d) => (0, d.min_pair_ess),
    };

    debug!(
        "{method} N = {n} seed = {seed}: estimate {:.6} in {:.3}s",
        output.estimate.total(),
        cpu_time_s
    );
    Ok(SmoothingResult {
        method,
        n,
        run: 0,
        seed,
        estimate: output.estimate.total(),
        mean_term: output.estimate.mean(),
        cpu_time_s,
        rejection_fallbacks,
        min_pair_ess,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::ScoreFunctional;
    use crate::model::{DiscreteCox, ModelParameters, Prior};

    #[test]
    fn method_names_round_trip() {
        for method in SmoothingMethod::ALL {
            assert_eq!(method.name().parse::<SmoothingMethod>().unwrap(), method);
            assert_eq!(method.to_string(), method.name());
        }
        let err = "FFBS_ON3".parse::<SmoothingMethod>().unwrap_err();
        assert!(matches!(err, SmoothingError::UnknownMethod(ref s) if s == "FFBS_ON3"));
        assert!(err.to_string().contains("two-filter_ON_prop"));
        assert!("ffbs_on".parse::<SmoothingMethod>().is_err());
    }

    #[test]
    fn only_two_filter_methods_need_the_information_filter() {
        let options = SmoothingOptions::default();
        for method in SmoothingMethod::ALL {
            assert_eq!(
                Smoother::new(method, &options).needs_information_filter(),
                method.needs_information_filter()
            );
        }
        assert!(!SmoothingMethod::FfbsOn2.needs_information_filter());
        assert!(SmoothingMethod::TwoFilterOn.needs_information_filter());
    }

    #[test]
    fn worker_rejects_zero_particles_and_empty_data() {
        let params = ModelParameters::default();
        let model = DiscreteCox::new(params).unwrap();
        let prior = model.stationary_prior().unwrap();
        let log_gamma = |x: &f64| prior.log_density(x);
        let score = ScoreFunctional::new(params);
        let data = vec![1u64, 0, 2];
        let problem = SmoothingProblem::new(&model, &model, &data, &score, &log_gamma);
        let options = SmoothingOptions::default();
        assert!(matches!(
            smoothing_worker(SmoothingMethod::FfbsOn2, 0, &problem, 1, &options),
            Err(SmoothingError::InvalidParticleCount(0))
        ));
        let empty: Vec<u64> = Vec::new();
        let problem = SmoothingProblem::new(&model, &model, &empty, &score, &log_gamma);
        assert!(matches!(
            smoothing_worker(SmoothingMethod::TwoFilterOn2, 10, &problem, 1, &options),
            Err(SmoothingError::EmptyObservations)
        ));
    }

    #[test]
    fn worker_fills_the_result_record() {
        let params = ModelParameters::default();
        let model = DiscreteCox::new(params).unwrap();
        let prior = model.stationary_prior().unwrap();
        let log_gamma = |x: &f64| prior.log_density(x);
        let score = ScoreFunctional::new(params);
        let (_, data) = model.simulate(&mut StdRng::seed_from_u64(9), 12).unwrap();
        let problem = SmoothingProblem::new(&model, &model, &data, &score, &log_gamma);
        let options = SmoothingOptions::default();
        for method in SmoothingMethod::ALL {
            let result = smoothing_worker(method, 30, &problem, 77, &options).unwrap();
            assert_eq!(result.method, method);
            assert_eq!(result.n, 30);
            assert_eq!(result.seed, 77);
            assert_eq!(result.run, 0);
            assert!(result.estimate.is_finite());
            assert!((result.mean_term * 11.0 - result.estimate).abs() < 1e-9);
            assert!(result.cpu_time_s >= 0.0);
            assert_eq!(result.rejection_fallbacks, 0);
            assert_eq!(
                result.min_pair_ess.is_some(),
                matches!(
                    method,
                    SmoothingMethod::TwoFilterOn | SmoothingMethod::TwoFilterOnProp
                )
            );
        }
    }

    #[test]
    fn worker_reports_rejection_fallbacks() {
        let params = ModelParameters::default();
        let model = DiscreteCox::new(params).unwrap();
        let prior = model.stationary_prior().unwrap();
        let log_gamma = |x: &f64| prior.log_density(x);
        let score = ScoreFunctional::new(params);
        let (_, data) = model.simulate(&mut StdRng::seed_from_u64(10), 6).unwrap();
        let problem = SmoothingProblem::new(&model, &model, &data, &score, &log_gamma);
        let options = SmoothingOptions {
            max_rejection_trials: 0,
            ..SmoothingOptions::default()
        };
        let result = smoothing_worker(SmoothingMethod::FfbsOn, 20, &problem, 5, &options).unwrap();
        // every one of the N trajectories falls back at each of the T - 1 steps
        assert_eq!(result.rejection_fallbacks, 20 * 5);
        assert_eq!(result.min_pair_ess, None);
        let result = smoothing_worker(SmoothingMethod::FfbsOn2, 20, &problem, 5, &options).unwrap();
        assert_eq!(result.rejection_fallbacks, 0);
    }
}
