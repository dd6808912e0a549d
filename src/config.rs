//! Optimization directory configuration.
//!
//! An optimization directory holds `optimization.yaml`, the input template
//! and, once a run has started, the history journal and per-trial run
//! directories. Settings are read with `figment`: the YAML file first, then
//! `PICOPT_`-prefixed environment variables (`__` separates nested keys, so
//! `PICOPT_STOP__MAX_TRIALS=50` overrides `stop.max_trials`).
//!
//! ```yaml
//! direction: maximize
//! space:
//!   variables:
//!     - { name: a0, kind: continuous, lower: 1.0, upper: 4.0 }
//!     - { name: nz, kind: integer, lower: 64, upper: 512 }
//!   fidelity: { name: resolution, lower: 0.25, upper: 1.0 }
//!   constraints: ["nz >= 100 * a0"]
//!   outcome_constraints: ["beam.charge >= 10"]
//! template: template.in
//! max_in_flight: 4
//! proposer: { kind: sobol, seed: 7 }
//! fidelity_levels: [0.25, 1.0]
//! stop: { max_trials: 40, max_duration_secs: 86400 }
//! execution:
//!   command: [mpirun, -n, "4", warpx.3d, inputs]
//!   timeout_secs: 7200
//! extraction: { file: diags/summary.json, objective: beam.energy }
//! ```
//!
//! Relative paths are resolved against the optimization directory.

use core::time::Duration;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::{Driver, DriverBuilder};
use crate::error::Result;
use crate::execution::{LocalExecutor, ResourceRequest};
use crate::extraction::JsonFileExtractor;
use crate::parameter::{ParameterPoint, SearchSpace};
use crate::proposer::{FidelityLadder, Proposer, RandomProposer, SobolProposer};
use crate::stop::StopPolicy;
use crate::template::Template;
use crate::types::Direction;

/// Name of the configuration file inside an optimization directory.
pub const CONFIG_FILE: &str = "optimization.yaml";

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Returned when the YAML file or an environment override cannot be
    /// read or does not match the schema.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Returned when `max_in_flight` is zero.
    #[error("invalid max_in_flight: {0}. Must be at least 1")]
    InvalidMaxInFlight(usize),

    /// Returned when no simulation command is given.
    #[error("execution.command cannot be empty")]
    EmptyCommand,

    /// Returned when the objective key is empty.
    #[error("extraction.objective cannot be empty")]
    EmptyObjective,

    /// Returned when a fidelity level lies outside the declared axis or no
    /// axis is declared.
    #[error("invalid fidelity level {0}: {1}")]
    InvalidFidelityLevel(f64, String),

    /// Returned when a stop condition has an unusable value.
    #[error("invalid stop condition: {0}")]
    InvalidStop(String),

    /// Returned when `logging.level` is not a known level.
    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Returned when `logging.format` is neither `json` nor `pretty`.
    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::Config(e.to_string())
    }
}

/// Which proposer to use.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProposerConfig {
    /// Uniform random sampling.
    #[default]
    Random,
    /// Scrambled Sobol sequence.
    Sobol,
}

/// Proposer selection and seed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerSection {
    /// The algorithm.
    #[serde(flatten)]
    pub kind: ProposerConfig,
    /// Seed for reproducible proposals.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// `stop.no_improvement`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoImprovementConfig {
    /// Number of recent full-fidelity completions considered.
    pub window: usize,
    /// Smallest change that counts as an improvement.
    #[serde(default)]
    pub min_delta: f64,
}

/// Stop conditions; any one met ends the run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    /// Trial budget (completed plus failed, across resumes).
    pub max_trials: Option<usize>,
    /// Time budget of one run.
    pub max_duration_secs: Option<u64>,
    /// Sliding-window stall detection.
    pub no_improvement: Option<NoImprovementConfig>,
    /// Budget in relative cost units.
    pub max_cost: Option<f64>,
}

impl StopConfig {
    /// Convert to a [`StopPolicy`].
    #[must_use]
    pub fn to_policy(&self) -> StopPolicy {
        let mut policy = StopPolicy::new();
        if let Some(n) = self.max_trials {
            policy = policy.max_trials(n);
        }
        if let Some(secs) = self.max_duration_secs {
            policy = policy.max_duration(Duration::from_secs(secs));
        }
        if let Some(stall) = &self.no_improvement {
            policy = policy.no_improvement(stall.window, stall.min_delta);
        }
        if let Some(budget) = self.max_cost {
            policy = policy.max_cost(budget);
        }
        policy
    }
}

/// How simulations are run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Program and arguments, run inside each trial directory.
    pub command: Vec<String>,
    /// Per-simulation wall-clock limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Resources requested per simulation.
    #[serde(default)]
    pub resources: ResourceRequest,
}

/// Where the objective is read from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// JSON file relative to the trial output directory.
    pub file: PathBuf,
    /// Key (dotted path) of the objective.
    pub objective: String,
    /// Keys of auxiliary metrics.
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// Log output settings for the binary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Everything needed to run one optimization directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Minimize (default) or maximize the objective.
    #[serde(default)]
    pub direction: Direction,
    /// The search space.
    pub space: SearchSpace,
    /// Input template. Default: `template.in`.
    #[serde(default = "default_template")]
    pub template: PathBuf,
    /// Name of the rendered input file in each trial directory. Default: `inputs`.
    #[serde(default = "default_input_file")]
    pub input_file: String,
    /// History journal. Default: `history.jsonl`.
    #[serde(default = "default_history")]
    pub history: PathBuf,
    /// Parent of the per-trial directories. Default: `runs`.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// In-flight budget. Default: 1.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Bound on one extraction call.
    #[serde(default)]
    pub extraction_timeout_secs: Option<u64>,
    /// Time a stopping run waits for in-flight trials. Default: 60.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Proposer selection.
    #[serde(default)]
    pub proposer: ProposerSection,
    /// Evaluate every proposed point at each of these fidelities.
    #[serde(default)]
    pub fidelity_levels: Vec<f64>,
    /// Points evaluated before the proposer is consulted.
    #[serde(default)]
    pub initial_points: Vec<ParameterPoint>,
    /// Stop conditions.
    #[serde(default)]
    pub stop: StopConfig,
    /// Simulation command.
    pub execution: ExecutionConfig,
    /// Objective extraction.
    pub extraction: ExtractionConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_template() -> PathBuf {
    PathBuf::from("template.in")
}

fn default_input_file() -> String {
    "inputs".to_string()
}

fn default_history() -> PathBuf {
    PathBuf::from("history.jsonl")
}

fn default_workdir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_max_in_flight() -> usize {
    1
}

fn default_grace_period() -> u64 {
    60
}

impl OptimizationConfig {
    /// Load `<dir>/optimization.yaml` with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the file is missing or malformed
    /// (including an invalid search space), or the validation error of the
    /// first bad field.
    pub fn load(dir: impl AsRef<Path>) -> core::result::Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file(dir.as_ref().join(CONFIG_FILE)))
                .merge(Env::prefixed("PICOPT_").split("__")),
        )
    }

    /// Parse a YAML document without environment overrides.
    ///
    /// # Errors
    ///
    /// As [`load`](Self::load).
    pub fn from_yaml(yaml: &str) -> core::result::Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Yaml::string(yaml)))
    }

    fn from_figment(figment: Figment) -> core::result::Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> core::result::Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::InvalidMaxInFlight(self.max_in_flight));
        }
        if self.execution.command.is_empty() || self.execution.command[0].is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.extraction.objective.is_empty() {
            return Err(ConfigError::EmptyObjective);
        }

        for &level in &self.fidelity_levels {
            match self.space.fidelity() {
                None => {
                    return Err(ConfigError::InvalidFidelityLevel(
                        level,
                        "no fidelity axis is declared".to_string(),
                    ))
                }
                Some(axis) if !(axis.lower..=axis.upper).contains(&level) => {
                    return Err(ConfigError::InvalidFidelityLevel(
                        level,
                        format!("outside [{}, {}]", axis.lower, axis.upper),
                    ))
                }
                Some(_) => {}
            }
        }

        if self.stop.max_trials == Some(0) {
            return Err(ConfigError::InvalidStop("max_trials must be at least 1".to_string()));
        }
        if let Some(stall) = &self.stop.no_improvement {
            if stall.window == 0 {
                return Err(ConfigError::InvalidStop(
                    "no_improvement.window must be at least 1".to_string(),
                ));
            }
            if !stall.min_delta.is_finite() || stall.min_delta < 0.0 {
                return Err(ConfigError::InvalidStop(
                    "no_improvement.min_delta must be finite and >= 0".to_string(),
                ));
            }
        }
        if let Some(budget) = self.stop.max_cost {
            if !budget.is_finite() || budget <= 0.0 {
                return Err(ConfigError::InvalidStop(format!(
                    "max_cost must be positive, got {budget}"
                )));
            }
        }

        let levels = ["trace", "debug", "info", "warn", "error"];
        if !levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }
        let formats = ["json", "pretty"];
        if !formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.logging.format.clone()));
        }
        Ok(())
    }

    /// Assemble a [`DriverBuilder`] for the optimization directory `dir`.
    ///
    /// Reads the template. Opening the history happens in
    /// [`DriverBuilder::build`].
    ///
    /// # Errors
    ///
    /// Returns the template's parse or I/O error.
    pub fn into_builder(self, dir: impl AsRef<Path>) -> Result<DriverBuilder> {
        let dir = dir.as_ref();
        let template = Template::from_file(dir.join(&self.template))?;

        let (program, args) = self
            .execution
            .command
            .split_first()
            .ok_or_else(|| crate::Error::from(ConfigError::EmptyCommand))?;
        let mut executor = LocalExecutor::new(dir.join(&self.workdir), program.clone())
            .args(args.iter().cloned())
            .input_file(self.input_file.clone());
        if let Some(secs) = self.execution.timeout_secs {
            executor = executor.timeout(Duration::from_secs(secs));
        }

        let extractor = self
            .extraction
            .metrics
            .iter()
            .fold(
                JsonFileExtractor::new(&self.extraction.file, self.extraction.objective.clone()),
                |e, key| e.metric(key.clone()),
            );

        let mut builder = Driver::builder()
            .direction(self.direction)
            .space(self.space.clone())
            .template(template)
            .executor(executor)
            .extractor(extractor)
            .journal(dir.join(&self.history))
            .max_in_flight(self.max_in_flight)
            .stop(self.stop.to_policy())
            .grace_period(Duration::from_secs(self.grace_period_secs))
            .resources(self.execution.resources.clone());
        builder = self.attach_proposer(builder);
        if let Some(secs) = self.extraction_timeout_secs {
            builder = builder.extraction_timeout(Duration::from_secs(secs));
        }
        for point in self.initial_points {
            builder = builder.enqueue(point);
        }
        Ok(builder)
    }

    fn attach_proposer(&self, builder: DriverBuilder) -> DriverBuilder {
        fn ladder(
            builder: DriverBuilder,
            inner: impl Proposer + 'static,
            levels: &[f64],
        ) -> DriverBuilder {
            if levels.is_empty() {
                builder.proposer(inner)
            } else {
                builder.proposer(FidelityLadder::new(inner, levels.to_vec()))
            }
        }

        let levels = &self.fidelity_levels;
        match (&self.proposer.kind, self.proposer.seed) {
            (ProposerConfig::Random, Some(seed)) => {
                ladder(builder, RandomProposer::with_seed(seed), levels)
            }
            (ProposerConfig::Random, None) => ladder(builder, RandomProposer::new(), levels),
            (ProposerConfig::Sobol, Some(seed)) => {
                ladder(builder, SobolProposer::with_seed(seed), levels)
            }
            (ProposerConfig::Sobol, None) => ladder(builder, SobolProposer::new(), levels),
        }
    }
}
