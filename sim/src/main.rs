//! SMOOTHING SIM: an experiment harness for offline particle smoothers.
//!
//! The program simulates a data set from a state-space model, then runs every
//! requested smoothing method at every requested particle count a number of
//! times, writing one CSV row per run and logging a per-`(method, N)` summary.
//!
//! You can run an experiment either by:
//!   1. Loading all parameters from a configuration file (TOML/JSON/YAML)
//!   2. Specifying parameters via command-line flags

mod common;

use clap::{Args, Parser, Subcommand};
use common::{init_logger, prepare_output_file};
use log::{error, info, warn};
use nalgebra::DVector;
use rand::SeedableRng;
use rand::rngs::StdRng;
use smoothing::experiment::{
    ExperimentConfig, ExperimentPlan, LoggingConfig, ModelKind, ResultSummary, run_experiment,
    summarize,
};
use smoothing::functional::{AdditiveFunctional, LagProduct, ScoreFunctional};
use smoothing::kalman::kalman_smoother;
use smoothing::linear_gaussian::LinearGaussian;
use smoothing::model::{DiscreteCox, ModelParameters, Prior, StateSpaceModel};
use smoothing::particle::FilterConfig;
use smoothing::resampling::ResamplingStrategy;
use smoothing::smoother::{SmoothingMethod, SmoothingOptions, SmoothingProblem, SmoothingResult};
use std::error::Error;
use std::path::{Path, PathBuf};

const LONG_ABOUT: &str = "SMOOTHING SIM: an experiment harness for offline particle smoothers.

A data set is simulated from either the discretely observed Cox model (AR(1) log-intensity,
Poisson counts) or the linear-Gaussian AR(1) model. Each requested smoothing method is then
run at each requested particle count, `runs` times with independent seeds.

Methods:
  FFBS_ON             forward filtering, backward sampling with rejection draws
  FFBS_ON2            forward filtering, backward sampling with exact backward weights
  two-filter_ON       two-filter smoothing over i.i.d. pairs
  two-filter_ON_prop  two-filter smoothing with a Gaussian-tilted pair proposal
  two-filter_ON2      two-filter smoothing over all N x N pairs

You can run an experiment either by:
  1. Loading all parameters from a configuration file (TOML/JSON/YAML)
  2. Specifying parameters via command-line flags";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "An experiment harness for offline particle smoothers.", long_about = LONG_ABOUT)]
struct Cli {
    /// Run an experiment from a configuration file (TOML/JSON/YAML)
    /// This option overrides any subcommand arguments
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Command to execute (ignored if --config is provided)
    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Run the smoothing tasks in parallel
    #[arg(long, global = true)]
    parallel: bool,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "run",
        about = "Run a smoothing experiment",
        long_about = "Simulate a data set and run every requested smoothing method at every requested particle count. One CSV row is written per run."
    )]
    Run(RunArgs),

    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// State-space model to simulate and smooth
    #[arg(long, value_enum, default_value_t = ModelKind::DiscreteCox)]
    model: ModelKind,

    /// Mean of the latent AR(1) chain
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    mu: f64,

    /// Autoregressive coefficient, |phi| < 1
    #[arg(long, default_value_t = 0.9, allow_negative_numbers = true)]
    phi: f64,

    /// Innovation standard deviation
    #[arg(long, default_value_t = 0.5)]
    sigma: f64,

    /// Observation noise standard deviation (linear-Gaussian model only)
    #[arg(long, default_value_t = 1.0)]
    obs_sigma: f64,

    /// Number of observations T
    #[arg(short = 'T', long = "horizon", default_value_t = 100)]
    horizon: usize,

    /// Seed used to simulate the data set
    #[arg(long, default_value_t = 0)]
    data_seed: u64,

    /// Smoothing methods to run (comma separated; all methods if omitted)
    #[arg(short, long, value_enum, value_delimiter = ',')]
    methods: Vec<SmoothingMethod>,

    /// Particle counts N (comma separated)
    #[arg(short = 'N', long = "particles", value_delimiter = ',', default_values_t = [100, 400, 1600])]
    particles: Vec<usize>,

    /// Independent runs per (method, N)
    #[arg(short, long, default_value_t = 10)]
    runs: usize,

    /// Seed of the generator handing out per-run seeds
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Resampling scheme used by the particle filters
    #[arg(long, value_enum, default_value_t = ResamplingStrategy::Systematic)]
    resampling: ResamplingStrategy,

    /// Resample when ESS < threshold * N; 1.0 resamples at every step
    #[arg(long, default_value_t = 1.0)]
    ess_threshold: f64,

    /// Proposals per backward step before FFBS_ON falls back to an exact draw
    #[arg(long, default_value_t = smoothing::backward::DEFAULT_MAX_REJECTION_TRIALS)]
    max_rejection_trials: usize,

    /// Also parallelise inside each run (backward traces and two-filter rows)
    #[arg(long)]
    inner_parallel: bool,

    /// Output CSV file, one row per run
    #[arg(short, long, value_parser, default_value = "smoothing_results.csv")]
    output: PathBuf,

    /// Optional CSV file with one row per (method, N)
    #[arg(long, value_parser)]
    summary: Option<PathBuf>,
}

impl RunArgs {
    fn into_config(self, parallel: bool, logging: LoggingConfig) -> ExperimentConfig {
        let methods = if self.methods.is_empty() {
            SmoothingMethod::ALL.to_vec()
        } else {
            self.methods
        };
        ExperimentConfig {
            model: self.model,
            obs_sigma: self.obs_sigma,
            horizon: self.horizon,
            data_seed: self.data_seed,
            parallel,
            output: self.output.to_string_lossy().into_owned(),
            summary_output: self.summary.map(|p| p.to_string_lossy().into_owned()),
            params: ModelParameters {
                mu: self.mu,
                phi: self.phi,
                sigma: self.sigma,
            },
            plan: ExperimentPlan {
                methods,
                particle_counts: self.particles,
                runs: self.runs,
                base_seed: self.seed,
            },
            options: SmoothingOptions {
                max_rejection_trials: self.max_rejection_trials,
                parallel: self.inner_parallel,
                filter: FilterConfig {
                    resampling_strategy: self.resampling,
                    ess_threshold: self.ess_threshold,
                },
            },
            logging,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output path of the template (.toml, .json, .yaml or .yml)
    #[arg(short, long, default_value = "smoothing.toml")]
    output: PathBuf,
}

fn validate_config(config: &ExperimentConfig) -> Result<(), Box<dyn Error>> {
    config.params.validate()?;
    config.options.filter.validate()?;
    if config.horizon == 0 {
        return Err("horizon must be at least 1".into());
    }
    if config.plan.methods.is_empty() {
        return Err("no smoothing methods requested".into());
    }
    if config.plan.particle_counts.contains(&0) {
        return Err("particle counts must be positive".into());
    }
    if config.plan.runs == 0 {
        warn!("runs = 0, nothing to do");
    }
    Ok(())
}

/// Simulate the data set and run the sweep described by `config`.
fn run_experiment_config(config: &ExperimentConfig) -> Result<(), Box<dyn Error>> {
    validate_config(config)?;
    info!("Model: {:?}", config.model);
    info!(
        "Parameters: mu = {}, phi = {}, sigma = {}",
        config.params.mu, config.params.phi, config.params.sigma
    );
    info!("Horizon T = {}, data seed = {}", config.horizon, config.data_seed);
    info!(
        "Methods: {}",
        config
            .plan
            .methods
            .iter()
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("Particle counts: {:?}", config.plan.particle_counts);
    info!("Runs: {}, base seed = {}", config.plan.runs, config.plan.base_seed);
    info!("Parallel: {}", config.parallel);

    let mut data_rng = StdRng::seed_from_u64(config.data_seed);
    match config.model {
        ModelKind::DiscreteCox => {
            let model = DiscreteCox::new(config.params)?;
            let prior = model.stationary_prior()?;
            let log_gamma = |x: &f64| prior.log_density(x);
            let (_, data) = model.simulate(&mut data_rng, config.horizon)?;
            info!(
                "Simulated {} counts, total {}",
                data.len(),
                data.iter().sum::<u64>()
            );
            let score = ScoreFunctional::new(config.params);
            let problem = SmoothingProblem::new(&model, &model, &data, &score, &log_gamma);
            sweep(config, &problem)
        }
        ModelKind::LinearGaussian => {
            let model = LinearGaussian::scalar(&config.params, config.obs_sigma)?;
            let prior = model.stationary_prior();
            let log_gamma = |x: &DVector<f64>| prior.log_density(x);
            let (_, data) = model.simulate(&mut data_rng, config.horizon)?;
            let exact = kalman_smoother(&model, &data)?.expected_lag_product_total();
            info!("Kalman smoother reference for sum of x_t x_(t+1): {exact:.6}");
            let problem = SmoothingProblem::new(&model, &model, &data, &LagProduct, &log_gamma);
            sweep(config, &problem)
        }
    }
}

fn sweep<M, I, F>(
    config: &ExperimentConfig,
    problem: &SmoothingProblem<'_, M, I, F>,
) -> Result<(), Box<dyn Error>>
where
    M: StateSpaceModel,
    I: StateSpaceModel<State = M::State, Observation = M::Observation>,
    F: AdditiveFunctional<M::State> + ?Sized,
{
    let output = Path::new(&config.output);
    prepare_output_file(output)?;
    let summary_output = config.summary_output.as_deref().map(Path::new);
    if let Some(path) = summary_output {
        prepare_output_file(path)?;
    }

    let report = run_experiment(&config.plan, problem, &config.options, config.parallel);

    SmoothingResult::to_csv(&report.results, output)?;
    info!("Wrote {} results to {}", report.results.len(), output.display());

    let summary = summarize(&report.results);
    for row in &summary {
        info!(
            "{:<18} N = {:>6}: mean {:>12.6}  std {:>10.6}  cpu {:>8.4}s  ({} runs)",
            row.method.name(),
            row.n,
            row.mean_estimate,
            row.std_estimate,
            row.mean_cpu_time_s,
            row.runs
        );
    }
    if let Some(path) = summary_output {
        ResultSummary::to_csv(&summary, path)?;
        info!("Wrote summary to {}", path.display());
    }

    if !report.failures.is_empty() {
        error!("{} task(s) failed", report.failures.len());
        for (task, err) in &report.failures {
            error!(
                "  {} N = {} run {} (seed {}): {}",
                task.method, task.n, task.run, task.seed, err
            );
        }
        return Err(format!("{} task(s) failed", report.failures.len()).into());
    }
    Ok(())
}

fn run_from_config(config_path: &Path, cli_parallel: bool) -> Result<(), Box<dyn Error>> {
    info!("Loading configuration from {}", config_path.display());
    let mut config = ExperimentConfig::from_file(config_path)?;

    // Override parallel setting if CLI flag is set
    if cli_parallel {
        config.parallel = true;
    }
    info!("Configuration loaded successfully");
    info!("Output: {}", config.output);
    run_experiment_config(&config)
}

fn create_config_file(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    prepare_output_file(&args.output)?;
    ExperimentConfig::default().to_file(&args.output)?;
    println!("Template configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // If --config is provided, load config and potentially override logger with config values
    if let Some(ref config_path) = cli.config {
        let config = ExperimentConfig::from_file(config_path)?;
        let config_log_file = config.logging.file.as_ref().map(PathBuf::from);
        let log_file = cli.log_file.as_ref().or(config_log_file.as_ref());
        init_logger(config.logging.level.as_str(), log_file)?;
        return run_from_config(config_path, cli.parallel);
    }

    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match cli.command {
        Some(Command::Run(args)) => {
            let logging = LoggingConfig {
                level: cli.log_level.clone(),
                file: cli
                    .log_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            };
            let config = args.into_config(cli.parallel, logging);
            run_experiment_config(&config)
        }
        Some(Command::CreateConfig(args)) => create_config_file(&args),
        None => {
            eprintln!("Error: No command provided. Use -h or --help for usage information.");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("smoothing-sim").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn run_arguments_build_a_config() {
        let cli = parse(&[
            "run",
            "-m",
            "FFBS_ON2,two-filter_ON_prop",
            "-N",
            "50,200",
            "--runs",
            "3",
            "--mu",
            "-1.5",
            "-T",
            "40",
            "--resampling",
            "stratified",
            "--parallel",
        ]);
        assert!(cli.parallel);
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected the run subcommand");
        };
        let config = args.into_config(true, LoggingConfig::default());
        assert_eq!(
            config.plan.methods,
            vec![SmoothingMethod::FfbsOn2, SmoothingMethod::TwoFilterOnProp]
        );
        assert_eq!(config.plan.particle_counts, vec![50, 200]);
        assert_eq!(config.plan.runs, 3);
        assert_eq!(config.params.mu, -1.5);
        assert_eq!(config.horizon, 40);
        assert_eq!(
            config.options.filter.resampling_strategy,
            ResamplingStrategy::Stratified
        );
        assert!(config.parallel);
    }

    #[test]
    fn omitted_methods_mean_all_methods() {
        let Some(Command::Run(args)) = parse(&["run"]).command else {
            panic!("expected the run subcommand");
        };
        let config = args.into_config(false, LoggingConfig::default());
        assert_eq!(config.plan.methods, SmoothingMethod::ALL.to_vec());
        assert_eq!(config.params, ModelParameters::default());
    }

    #[test]
    fn unknown_method_is_rejected_by_the_parser() {
        let parsed = Cli::try_parse_from(["smoothing-sim", "run", "-m", "FFBS_ON3"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = ExperimentConfig::default();
        config.params.phi = 1.0;
        assert!(validate_config(&config).is_err());

        let mut config = ExperimentConfig::default();
        config.plan.particle_counts = vec![10, 0];
        assert!(validate_config(&config).is_err());

        let mut config = ExperimentConfig::default();
        config.horizon = 0;
        assert!(validate_config(&config).is_err());

        assert!(validate_config(&ExperimentConfig::default()).is_ok());
    }

    #[test]
    fn small_experiment_writes_results_and_summary() {
        let dir = tempdir().unwrap();
        for model in [ModelKind::DiscreteCox, ModelKind::LinearGaussian] {
            let output = dir.path().join(format!("{model:?}/results.csv"));
            let summary = dir.path().join(format!("{model:?}/summary.csv"));
            let config = ExperimentConfig {
                model,
                horizon: 8,
                output: output.to_string_lossy().into_owned(),
                summary_output: Some(summary.to_string_lossy().into_owned()),
                plan: ExperimentPlan {
                    particle_counts: vec![16],
                    runs: 2,
                    ..ExperimentPlan::default()
                },
                ..ExperimentConfig::default()
            };
            run_experiment_config(&config).unwrap();
            let results = SmoothingResult::from_csv(&output).unwrap();
            assert_eq!(results.len(), 5 * 2);
            assert!(results.iter().all(|r| r.estimate.is_finite()));
            let summary = std::fs::read_to_string(&summary).unwrap();
            assert_eq!(summary.lines().count(), 1 + 5);
        }
    }

    #[test]
    fn template_config_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("template.yaml");
        create_config_file(&CreateConfigArgs {
            output: path.clone(),
        })
        .unwrap();
        assert_eq!(
            ExperimentConfig::from_file(&path).unwrap(),
            ExperimentConfig::default()
        );
    }
}
