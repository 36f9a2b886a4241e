//! Offline particle smoothing for state-space models
//!
//! This crate estimates smoothed expectations of additive functionals,
//!
//! $$
//! \sum_{t=0}^{T-2} E\left[\psi_t(X_t, X_{t+1}) \mid y_{0:T-1}\right],
//! $$
//!
//! from the output of a bootstrap particle filter. Two families of smoother are provided:
//!
//! - **Forward filtering, backward sampling** ([backward]): trajectories are redrawn backward through the
//!   stored forward populations, either by enumerating all backward weights (O(N²)) or by rejection
//!   sampling against a bound on the transition density (O(N) expected).
//! - **Two-filter smoothing** ([two_filter]): a forward filter and an information filter run on the
//!   reversed data are combined pairwise, either over all N×N pairs or through O(N) proposals.
//!
//! Both families operate on any model implementing [`model::StateSpaceModel`]. Two models ship with the
//! crate: the discretely observed Cox process [`model::DiscreteCox`] (AR(1) log-intensity, Poisson
//! counts) and the multivariate [`linear_gaussian::LinearGaussian`] model, whose exact smoothing
//! moments are available from [`kalman::kalman_smoother`] and serve as a reference.
//!
//! ## Crate overview
//!
//! - [backward]: FFBS samplers.
//! - [error]: The crate error type.
//! - [experiment]: Sweeps over `(method, N, run)`, result summaries, CSV output, and experiment configuration.
//! - [functional]: Additive functionals and weighted estimates.
//! - [kalman]: Kalman filter and RTS smoother for the linear-Gaussian model.
//! - [linalg]: Cholesky, Gaussian densities, and stationary covariances.
//! - [linear_gaussian]: The linear-Gaussian state-space model.
//! - [model]: Model traits, priors, and the Cox model.
//! - [particle]: The bootstrap particle filter and its genealogy.
//! - [resampling]: Log-weight utilities and resampling schemes.
//! - [smoother]: Method selection and the per-run worker.
//! - [two_filter]: Two-filter smoothers.
//!
//! ## Reproducibility
//!
//! Every run is a pure function of its `(method, N, seed)` triple: it seeds its own
//! [`rand::rngs::StdRng`], so runs can be dispatched on the rayon pool in any order and still reproduce
//! their sequential results bit for bit.
pub mod backward;
pub mod error;
pub mod experiment;
pub mod functional;
pub mod kalman;
pub mod linalg;
pub mod linear_gaussian;
pub mod model;
pub mod particle;
pub mod resampling;
pub mod smoother;
pub mod two_filter;

pub use backward::{BackwardKernel, BackwardSampler, SmoothedTrajectory};
pub use error::{Result, SmoothingError};
pub use experiment::{ExperimentConfig, ExperimentPlan, ExperimentReport, run_experiment, summarize};
pub use functional::{AdditiveEstimate, AdditiveFunctional, LagProduct, ScoreFunctional};
pub use model::{DiscreteCox, InformationModel, ModelParameters, Prior, StateSpaceModel};
pub use particle::{FilterConfig, Genealogy, ParticleFilter};
pub use resampling::ResamplingStrategy;
pub use smoother::{
    SmoothingMethod, SmoothingOptions, SmoothingProblem, SmoothingResult, smoothing_worker,
};
pub use two_filter::{TwoFilterKernel, TwoFilterSmoother};
