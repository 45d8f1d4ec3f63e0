//! Command bodies behind the CLI: one simulated episode or one training run.
//!
//! Both are synchronous and meant to run off the async runtime's worker threads.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, instrument};

use crate::agent::{AgentLoader, LinearGaussianAgent};
use crate::cancel::CancellationToken;
use crate::controller::{ControllerKind, GainFeedback, LearnedPolicy};
use crate::environment::{Environment, TurbineStabEnv};
use crate::orchestrator::{Orchestrator, TrainingConfig, TrainingOutcome};
use crate::settings::Settings;
use crate::simulator::EpisodeSimulator;
use crate::trajectory::{save_table, OutputLocation};

/// Which controller drives a simulated episode.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationMode {
    Lqr,
    Agent(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub output: PathBuf,
    pub rows: usize,
    pub sim_time: f64,
}

/// Run one episode and write its trajectory under the configured logs root.
#[instrument(skip(settings, cancel))]
pub fn simulate(
    settings: &Settings,
    mode: &SimulationMode,
    max_time: Option<f64>,
    cancel: CancellationToken,
) -> Result<SimulationReport> {
    let max_time = max_time.unwrap_or(settings.simulation.max_time);
    let mut env = TurbineStabEnv::new(settings.environment.clone())?;
    let logs_root = &settings.simulation.logs_root;

    let (controller, location) = match mode {
        SimulationMode::Lqr => {
            let gain = GainFeedback::from_file(
                &settings.controller.gain_matrix_path,
                &settings.controller.gain_matrix_key,
                settings.controller.max_input,
            )?;
            (ControllerKind::Lqr(gain), OutputLocation::for_lqr(logs_root))
        }
        SimulationMode::Agent(path) => {
            let location = OutputLocation::for_agent(logs_root, path)?;
            let agent = LinearGaussianAgent::load(path, Some(env.observation_dim()))
                .with_context(|| format!("Failed to load agent {:?}", path))?;
            (ControllerKind::Agent(LearnedPolicy::new(agent)), location)
        }
    };

    let table = EpisodeSimulator::new(max_time)?
        .with_cancellation(cancel)
        .run(&mut env, &controller)?;
    let output = save_table(&table, &location.dir, &location.prefix)?;

    info!("Saved {} rows of simulation data to {:?}", table.len(), output);
    Ok(SimulationReport {
        output,
        rows: table.len(),
        sim_time: env.time(),
    })
}

/// Train the built-in agent on replicas of the configured environment.
pub fn train(settings: &Settings, config: TrainingConfig, cancel: CancellationToken) -> Result<TrainingOutcome> {
    Orchestrator::new(config)
        .with_cancellation(cancel)
        .run::<LinearGaussianAgent, _>(TurbineStabEnv::factory(settings.environment.clone()), &settings.agent)
}
