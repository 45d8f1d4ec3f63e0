//! Training run coordinator: experiment, environment pool, observers and agent.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, instrument, warn};

use crate::agent::{AgentLoader, StopReason};
use crate::callbacks::{
    CallbackList, CheckpointCallback, MetricsCallback, ReportingCallback, TrainingCallback,
};
use crate::cancel::CancellationToken;
use crate::environment::{EnvFactory, Environment};
use crate::lifecycle::Experiment;
use crate::pool::EnvPool;
use crate::settings::TrainingSettings;

/// Everything a single training run needs to know.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Pool steps to train for.
    pub timesteps: u64,
    /// Checkpoint to continue from instead of a fresh agent.
    pub agent: Option<PathBuf>,
    /// Free text appended to the experiment manifest.
    pub note: Option<String>,
    pub no_reporting: bool,
    pub checkpoint_interval: u64,
    /// Replica count; `None` uses every available CPU.
    pub num_envs: Option<usize>,
    pub logs_root: PathBuf,
    pub experiment_suffix: String,
    pub metrics_log_interval: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::from(&TrainingSettings::default())
    }
}

impl From<&TrainingSettings> for TrainingConfig {
    fn from(settings: &TrainingSettings) -> Self {
        Self {
            timesteps: settings.timesteps,
            agent: None,
            note: None,
            no_reporting: !settings.reporting,
            checkpoint_interval: settings.checkpoint_interval,
            num_envs: settings.num_envs,
            logs_root: settings.logs_root.clone(),
            experiment_suffix: settings.experiment_suffix.clone(),
            metrics_log_interval: settings.log_interval,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingOutcome {
    pub experiment: Experiment,
    pub final_checkpoint: PathBuf,
    pub steps_completed: u64,
    pub cancelled: bool,
}

pub struct Orchestrator {
    config: TrainingConfig,
    cancel: CancellationToken,
    observers: Vec<Box<dyn TrainingCallback>>,
}

impl Orchestrator {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            observers: Vec::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Add an observer that runs after the built-in ones. Observers are handed
    /// to the next call to [`Orchestrator::run`].
    pub fn with_observer(mut self, observer: impl TrainingCallback + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn callbacks(&mut self, experiment: &Experiment) -> CallbackList {
        let mut callbacks = CallbackList::new().with(CheckpointCallback::new(
            self.config.checkpoint_interval,
            &experiment.agents_dir,
        ));
        if !self.config.no_reporting {
            callbacks.push(Box::new(ReportingCallback::new(&experiment.report_dir)));
        }
        callbacks.push(Box::new(MetricsCallback::new(self.config.metrics_log_interval)));
        for observer in std::mem::take(&mut self.observers) {
            callbacks.push(observer);
        }
        callbacks
    }

    /// Train an `A` against replicas built by `env_factory` and persist the
    /// final checkpoint. The pool is shut down on every exit path.
    #[instrument(skip_all, fields(timesteps = self.config.timesteps))]
    pub fn run<A, E>(&mut self, env_factory: EnvFactory<E>, agent_config: &A::Config) -> Result<TrainingOutcome>
    where
        A: AgentLoader,
        E: Environment + 'static,
    {
        let experiment = Experiment::create(&self.config.logs_root, &self.config.experiment_suffix)?;

        let mut pool = match self.config.num_envs {
            Some(n) => EnvPool::new(n, env_factory)?,
            None => EnvPool::with_available_parallelism(env_factory)?,
        };
        experiment.append_manifest(pool.config_snapshot(), self.config.note.as_deref());

        let mut callbacks = self.callbacks(&experiment);
        info!(
            "Training '{}' on {} replicas with observers {:?}",
            experiment.id,
            pool.num_envs(),
            callbacks.names()
        );

        let mut agent = match &self.config.agent {
            Some(path) => A::load(path, Some(pool.observation_dim()))
                .with_context(|| format!("Failed to resume from checkpoint {:?}", path))?,
            None => A::create(pool.observation_dim(), agent_config)?,
        };

        let summary = agent.learn(
            &mut pool,
            self.config.timesteps,
            &mut callbacks,
            &experiment,
            &self.cancel,
        )?;
        pool.close();

        let cancelled = summary.reason == StopReason::Cancelled;
        let final_steps = match summary.reason {
            StopReason::BudgetExhausted => self.config.timesteps,
            StopReason::Cancelled => {
                warn!("Training cancelled after {} of {} steps", summary.steps, self.config.timesteps);
                summary.steps
            }
            StopReason::CallbackRequested => {
                info!("Training stopped by an observer after {} of {} steps", summary.steps, self.config.timesteps);
                summary.steps
            }
        };
        let final_checkpoint = agent
            .save(&experiment.final_checkpoint_path(final_steps))
            .context("Failed to save final checkpoint")?;

        info!(
            "Training '{}' finished: {} steps, {} timesteps, final checkpoint {:?}",
            experiment.id,
            summary.steps,
            agent.num_timesteps(),
            final_checkpoint
        );
        Ok(TrainingOutcome {
            experiment,
            final_checkpoint,
            steps_completed: summary.steps,
            cancelled,
        })
    }
}
