//! Layered configuration: embedded defaults, optional local file, environment variables.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::agent::AgentConfig;
use crate::environment::EnvConfig;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Fixed-gain controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// JSON document holding the gain matrix; defaults to the crate's `data/Ksys.json`.
    #[serde(default = "default_gain_matrix_path")]
    pub gain_matrix_path: PathBuf,
    /// Key of the matrix inside that document.
    pub gain_matrix_key: String,
    /// Actuator scale dividing the feedback law output.
    pub max_input: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gain_matrix_path: default_gain_matrix_path(),
            gain_matrix_key: "Ksys_lqr".to_string(),
            max_input: 1.0,
        }
    }
}

/// Gain matrix shipped with the crate.
pub fn default_gain_matrix_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("data").join("Ksys.json")
}

/// Single-episode simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Simulated seconds per episode.
    pub max_time: f64,
    pub logs_root: PathBuf,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_time: 50.0,
            logs_root: PathBuf::from("logs"),
        }
    }
}

/// Training run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Pool steps to train for.
    pub timesteps: u64,
    /// Pool steps between periodic checkpoints.
    pub checkpoint_interval: u64,
    /// Pool steps between metric stream summaries.
    pub log_interval: u64,
    /// Replica count; defaults to the number of available CPUs.
    #[serde(default)]
    pub num_envs: Option<usize>,
    pub reporting: bool,
    pub logs_root: PathBuf,
    pub experiment_suffix: String,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            timesteps: 500_000,
            checkpoint_interval: 1_000,
            log_interval: 100,
            num_envs: None,
            reporting: true,
            logs_root: PathBuf::from("logs"),
            experiment_suffix: "ppo".to_string(),
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub environment: EnvConfig,
    pub controller: ControllerConfig,
    pub simulation: SimulationConfig,
    pub training: TrainingSettings,
    pub agent: AgentConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, `turbine.toml` if present,
    /// and `TURBINE__SECTION__KEY` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`Settings::load`], with an explicit configuration file that must exist.
    pub fn load_from(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(include_str!("../config.toml"), FileFormat::Toml))
            .add_source(File::with_name("turbine").required(false));

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("TURBINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        self.environment.validate()?;
        self.agent.validate()?;

        if !(self.controller.max_input > 0.0) {
            return Err(anyhow!("controller.max_input must be positive"));
        }
        if !(self.simulation.max_time >= 0.0) {
            return Err(anyhow!("simulation.max_time must be non-negative"));
        }
        if self.training.timesteps == 0 {
            return Err(anyhow!("training.timesteps cannot be 0"));
        }
        if self.training.checkpoint_interval == 0 {
            return Err(anyhow!("training.checkpoint_interval cannot be 0"));
        }
        if self.training.log_interval == 0 {
            return Err(anyhow!("training.log_interval cannot be 0"));
        }
        if self.training.num_envs == Some(0) {
            return Err(anyhow!("training.num_envs cannot be 0"));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(anyhow!("logging.format must be 'text' or 'json', got '{}'", self.logging.format));
        }
        if self.training.checkpoint_interval > self.training.timesteps {
            warn!(
                "checkpoint_interval {} exceeds timesteps {}; only the final checkpoint will be written",
                self.training.checkpoint_interval, self.training.timesteps
            );
        }
        Ok(())
    }
}
