//! Parameter sweep over `(method, N, run)`.
//!
//! A plan expands into a fixed list of tasks, each with its own seed. Tasks are
//! independent calls to [`smoothing_worker`], dispatched on the rayon pool or
//! one after the other; either way the results come back in task order.
//!
//! The configuration types serialize to JSON, YAML, or TOML, chosen by file
//! extension.

use crate::error::Result;
use crate::functional::AdditiveFunctional;
use crate::model::{ModelParameters, StateSpaceModel};
use crate::smoother::{
    SmoothingMethod, SmoothingOptions, SmoothingProblem, SmoothingResult, smoothing_worker,
};
use log::{error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;

fn default_methods() -> Vec<SmoothingMethod> {
    SmoothingMethod::ALL.to_vec()
}
fn default_particle_counts() -> Vec<usize> {
    vec![100, 400, 1600, 6400]
}
fn default_runs() -> usize {
    10
}
fn default_base_seed() -> u64 {
    42
}

/// Which evaluations to run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    #[serde(default = "default_methods")]
    pub methods: Vec<SmoothingMethod>,
    #[serde(default = "default_particle_counts")]
    pub particle_counts: Vec<usize>,
    /// Independent repetitions of every `(method, N)` pair.
    #[serde(default = "default_runs")]
    pub runs: usize,
    /// Seed of the generator that hands out the per-task seeds.
    #[serde(default = "default_base_seed")]
    pub base_seed: u64,
}

impl Default for ExperimentPlan {
    fn default() -> Self {
        ExperimentPlan {
            methods: default_methods(),
            particle_counts: default_particle_counts(),
            runs: default_runs(),
            base_seed: default_base_seed(),
        }
    }
}

/// A single unit of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmoothingTask {
    pub method: SmoothingMethod,
    pub n: usize,
    pub run: usize,
    pub seed: u64,
}

impl ExperimentPlan {
    /// Expand into tasks ordered by method, then N, then run.
    ///
    /// Seeds are drawn in that order from `StdRng::seed_from_u64(base_seed)`,
    /// so the task list is a function of the plan alone.
    pub fn tasks(&self) -> Vec<SmoothingTask> {
        let mut rng = StdRng::seed_from_u64(self.base_seed);
        let mut tasks =
            Vec::with_capacity(self.methods.len() * self.particle_counts.len() * self.runs);
        for &method in &self.methods {
            for &n in &self.particle_counts {
                for run in 0..self.runs {
                    tasks.push(SmoothingTask {
                        method,
                        n,
                        run,
                        seed: rng.random(),
                    });
                }
            }
        }
        tasks
    }
}

/// Results of a sweep. Failed tasks are reported alongside, not fatal.
#[derive(Clone, Debug, Default)]
pub struct ExperimentReport {
    pub results: Vec<SmoothingResult>,
    pub failures: Vec<(SmoothingTask, String)>,
}

/// Run every task of `plan` against `problem`.
pub fn run_experiment<M, I, F>(
    plan: &ExperimentPlan,
    problem: &SmoothingProblem<'_, M, I, F>,
    options: &SmoothingOptions,
    parallel: bool,
) -> ExperimentReport
where
    M: StateSpaceModel,
    I: StateSpaceModel<State = M::State, Observation = M::Observation>,
    F: AdditiveFunctional<M::State> + ?Sized,
{
    let tasks = plan.tasks();
    info!(
        "Running {} smoothing tasks ({} methods x {} particle counts x {} runs){}",
        tasks.len(),
        plan.methods.len(),
        plan.particle_counts.len(),
        plan.runs,
        if parallel { " in parallel" } else { "" }
    );

    let execute = |task: &SmoothingTask| {
        smoothing_worker(task.method, task.n, problem, task.seed, options).map(|mut result| {
            result.run = task.run;
            result
        })
    };

    let outcomes: Vec<Result<SmoothingResult>> = if parallel {
        let errors = Mutex::new(Vec::new());
        let outcomes: Vec<Result<SmoothingResult>> = tasks
            .par_iter()
            .map(|task| {
                let outcome = execute(task);
                if let Err(e) = &outcome {
                    if let Ok(mut errors) = errors.lock() {
                        errors.push(format!("{} N = {} run {}: {}", task.method, task.n, task.run, e));
                    }
                }
                outcome
            })
            .collect();
        for e in errors.into_inner().unwrap_or_default() {
            error!("{e}");
        }
        outcomes
    } else {
        tasks
            .iter()
            .map(|task| {
                let outcome = execute(task);
                if let Err(e) = &outcome {
                    error!("{} N = {} run {}: {}", task.method, task.n, task.run, e);
                }
                outcome
            })
            .collect()
    };

    let mut report = ExperimentReport::default();
    for (task, outcome) in tasks.into_iter().zip(outcomes) {
        match outcome {
            Ok(result) => report.results.push(result),
            Err(e) => report.failures.push((task, e.to_string())),
        }
    }
    info!(
        "Finished {} tasks, {} failed",
        report.results.len() + report.failures.len(),
        report.failures.len()
    );
    report
}

/// Aggregate of the runs of one `(method, N)` pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub method: SmoothingMethod,
    #[serde(rename = "N")]
    pub n: usize,
    pub runs: usize,
    pub mean_estimate: f64,
    /// Sample standard deviation; zero for a single run.
    pub std_estimate: f64,
    pub mean_cpu_time_s: f64,
}

/// Group results by `(method, N)` in that order.
pub fn summarize(results: &[SmoothingResult]) -> Vec<ResultSummary> {
    let mut groups: BTreeMap<(SmoothingMethod, usize), Vec<&SmoothingResult>> = BTreeMap::new();
    for r in results {
        groups.entry((r.method, r.n)).or_default().push(r);
    }
    groups
        .into_iter()
        .map(|((method, n), group)| {
            let k = group.len() as f64;
            let mean = group.iter().map(|r| r.estimate).sum::<f64>() / k;
            let var = if group.len() > 1 {
                group
                    .iter()
                    .map(|r| (r.estimate - mean).powi(2))
                    .sum::<f64>()
                    / (k - 1.0)
            } else {
                0.0
            };
            ResultSummary {
                method,
                n,
                runs: group.len(),
                mean_estimate: mean,
                std_estimate: var.sqrt(),
                mean_cpu_time_s: group.iter().map(|r| r.cpu_time_s).sum::<f64>() / k,
            }
        })
        .collect()
}

impl SmoothingResult {
    /// Write records to a CSV file with a header row.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read records written by [`SmoothingResult::to_csv`].
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for record in reader.deserialize() {
            records.push(record?);
        }
        Ok(records)
    }
}

impl ResultSummary {
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Which model the sweep runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// AR(1) latent log-intensity with Poisson counts.
    #[default]
    DiscreteCox,
    /// AR(1) latent state with Gaussian observations.
    LinearGaussian,
}

fn default_horizon() -> usize {
    100
}
fn default_data_seed() -> u64 {
    0
}
fn default_obs_sigma() -> f64 {
    1.0
}
fn default_output() -> String {
    "smoothing_results.csv".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Complete description of a sweep: model, data, plan, options, and output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub model: ModelKind,
    /// Observation noise of the linear-Gaussian model.
    #[serde(default = "default_obs_sigma")]
    pub obs_sigma: f64,
    /// Number of observations T.
    #[serde(default = "default_horizon")]
    pub horizon: usize,
    /// Seed used to simulate the data set.
    #[serde(default = "default_data_seed")]
    pub data_seed: u64,
    /// Run tasks on the rayon pool.
    #[serde(default)]
    pub parallel: bool,
    /// CSV file receiving one row per run.
    #[serde(default = "default_output")]
    pub output: String,
    /// Optional CSV file receiving one row per `(method, N)`.
    #[serde(default)]
    pub summary_output: Option<String>,
    #[serde(default)]
    pub params: ModelParameters,
    #[serde(default)]
    pub plan: ExperimentPlan,
    #[serde(default)]
    pub options: SmoothingOptions,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            model: ModelKind::default(),
            obs_sigma: default_obs_sigma(),
            horizon: default_horizon(),
            data_seed: default_data_seed(),
            parallel: false,
            output: default_output(),
            summary_output: None,
            params: ModelParameters::default(),
            plan: ExperimentPlan::default(),
            options: SmoothingOptions::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}
