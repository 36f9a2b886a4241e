//! Error types for the smoothing engine.
//!
//! Only a handful of these are expected to reach a caller during normal
//! operation: an unknown method name, a bad particle count, or a model that
//! was configured with parameters that make its densities undefined. A
//! collapsed filter is reported per run so that a sweep can carry on with
//! the remaining tasks.

use thiserror::Error;

/// Errors raised by models, filters, and smoothers.
#[derive(Error, Debug)]
pub enum SmoothingError {
    /// Model parameters make a density undefined (non-positive variance, non-stationary prior, ...).
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// The number of particles must be at least one.
    #[error("invalid particle count {0}: at least one particle is required")]
    InvalidParticleCount(usize),

    /// Method name outside the closed set of smoothing algorithms.
    #[error(
        "unknown smoothing method '{0}' (expected one of FFBS_ON, FFBS_ON2, two-filter_ON, two-filter_ON_prop, two-filter_ON2)"
    )]
    UnknownMethod(String),

    /// No observations were supplied to the filter.
    #[error("observation sequence is empty")]
    EmptyObservations,

    /// Every particle weight underflowed or became NaN at time `t`.
    #[error("particle filter collapsed at t = {t}: no particle has a finite weight")]
    FilterCollapse { t: usize },

    /// Backward or pairwise smoothing weights at time `t` are all zero.
    #[error("smoothing weights degenerate at t = {t}: every candidate has zero weight")]
    DegenerateWeights { t: usize },

    /// Inconsistent arguments passed to an algorithm.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// CSV read or write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SmoothingError>;
