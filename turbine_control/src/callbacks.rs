//! Observers invoked after every training step.
//!
//! Each observer is self-contained: none reads state owned by another, so the
//! list can be composed in any order and any optional observer can be left out.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::agent::{Checkpointable, UpdateStats};
use crate::lifecycle::Experiment;
use crate::metrics::ScalarLog;
use crate::state::StepOutcome;

/// What an observer can see after a step.
pub struct StepContext<'a> {
    /// Pool steps completed so far.
    pub num_steps: u64,
    /// Environment transitions consumed so far, across all replicas.
    pub num_timesteps: u64,
    /// The latest batch, one outcome per replica.
    pub transitions: &'a [StepOutcome],
    pub agent: &'a dyn Checkpointable,
    pub experiment: &'a Experiment,
    /// Present on steps where the agent updated its parameters.
    pub update: Option<&'a UpdateStats>,
}

pub struct TrainingEnd<'a> {
    pub num_steps: u64,
    pub num_timesteps: u64,
    pub experiment: &'a Experiment,
}

pub trait TrainingCallback: Send {
    fn name(&self) -> &str;

    fn on_training_start(&mut self, _experiment: &Experiment) -> Result<()> {
        Ok(())
    }

    /// Return `Ok(false)` to ask the learning loop to stop.
    fn on_step(&mut self, ctx: &StepContext<'_>) -> Result<bool>;

    fn on_training_end(&mut self, _end: &TrainingEnd<'_>) -> Result<()> {
        Ok(())
    }
}

/// Ordered observer pipeline.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    pub fn with(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.push(Box::new(callback));
        self
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    pub fn on_training_start(&mut self, experiment: &Experiment) -> Result<()> {
        for callback in self.callbacks.iter_mut() {
            callback.on_training_start(experiment)?;
        }
        Ok(())
    }

    /// Every observer runs on every step; training continues only if all agree.
    pub fn on_step(&mut self, ctx: &StepContext<'_>) -> Result<bool> {
        let mut keep_going = true;
        for callback in self.callbacks.iter_mut() {
            keep_going &= callback.on_step(ctx)?;
        }
        Ok(keep_going)
    }

    pub fn on_training_end(&mut self, end: &TrainingEnd<'_>) -> Result<()> {
        for callback in self.callbacks.iter_mut() {
            callback.on_training_end(end)?;
        }
        Ok(())
    }
}

/// Saves the agent every `save_freq` steps as `<prefix>_<steps>_steps.json`.
///
/// A failed save aborts training: checkpoints are the product of the run.
pub struct CheckpointCallback {
    save_freq: u64,
    save_path: PathBuf,
    name_prefix: String,
    saved: Vec<PathBuf>,
}

impl CheckpointCallback {
    pub fn new(save_freq: u64, save_path: impl Into<PathBuf>) -> Self {
        Self {
            save_freq: save_freq.max(1),
            save_path: save_path.into(),
            name_prefix: "rl_model".to_string(),
            saved: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.name_prefix = prefix.to_string();
        self
    }

    pub fn checkpoint_path(&self, num_steps: u64) -> PathBuf {
        self.save_path
            .join(format!("{}_{}_steps.json", self.name_prefix, num_steps))
    }

    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}

impl TrainingCallback for CheckpointCallback {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn on_training_start(&mut self, _experiment: &Experiment) -> Result<()> {
        std::fs::create_dir_all(&self.save_path)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", self.save_path))
    }

    fn on_step(&mut self, ctx: &StepContext<'_>) -> Result<bool> {
        if ctx.num_steps % self.save_freq == 0 {
            let path = self.checkpoint_path(ctx.num_steps);
            let saved = ctx
                .agent
                .save(&path)
                .with_context(|| format!("Periodic checkpoint at step {} failed", ctx.num_steps))?;
            self.saved.push(saved);
        }
        Ok(true)
    }
}

/// One finished episode of one replica.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeReport {
    pub episode: u64,
    pub replica: usize,
    pub num_steps: u64,
    pub episode_return: f64,
    pub length: u64,
    pub crashed: bool,
    pub end_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub num_steps: u64,
    pub num_timesteps: u64,
    pub episodes: u64,
    pub mean_return: Option<f64>,
    pub mean_length: Option<f64>,
    pub crash_rate: Option<f64>,
}

/// Structured per-episode report in the experiment's report directory.
/// Optional; write failures are logged and ignored.
pub struct ReportingCallback {
    report_dir: PathBuf,
    running_return: Vec<f64>,
    running_length: Vec<u64>,
    episodes_completed: u64,
    return_sum: f64,
    length_sum: u64,
    crashes: u64,
}

pub const EPISODES_FILE: &str = "episodes.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

impl ReportingCallback {
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self {
            report_dir: report_dir.into(),
            running_return: Vec::new(),
            running_length: Vec::new(),
            episodes_completed: 0,
            return_sum: 0.0,
            length_sum: 0,
            crashes: 0,
        }
    }

    pub fn episodes_completed(&self) -> u64 {
        self.episodes_completed
    }

    pub fn summary(&self, num_steps: u64, num_timesteps: u64) -> ReportSummary {
        let n = self.episodes_completed;
        let mean = |total: f64| (n > 0).then(|| total / n as f64);
        ReportSummary {
            num_steps,
            num_timesteps,
            episodes: n,
            mean_return: mean(self.return_sum),
            mean_length: mean(self.length_sum as f64),
            crash_rate: mean(self.crashes as f64),
        }
    }

    fn append_episode(dir: &Path, report: &EpisodeReport) -> Result<()> {
        let path = dir.join(EPISODES_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open report: {:?}", path))?;
        writeln!(file, "{}", serde_json::to_string(report)?)?;
        Ok(())
    }
}

impl TrainingCallback for ReportingCallback {
    fn name(&self) -> &str {
        "report"
    }

    fn on_training_start(&mut self, _experiment: &Experiment) -> Result<()> {
        if let Err(e) = std::fs::create_dir_all(&self.report_dir) {
            warn!("Could not create report directory {:?}: {}", self.report_dir, e);
        }
        Ok(())
    }

    fn on_step(&mut self, ctx: &StepContext<'_>) -> Result<bool> {
        let n = ctx.transitions.len();
        if self.running_return.len() != n {
            self.running_return = vec![0.0; n];
            self.running_length = vec![0; n];
        }

        for (replica, outcome) in ctx.transitions.iter().enumerate() {
            self.running_return[replica] += outcome.reward;
            self.running_length[replica] += 1;
            if !outcome.done {
                continue;
            }

            let report = EpisodeReport {
                episode: self.episodes_completed,
                replica,
                num_steps: ctx.num_steps,
                episode_return: self.running_return[replica],
                length: self.running_length[replica],
                crashed: outcome.info.crashed,
                end_time: outcome.info.time,
            };
            self.running_return[replica] = 0.0;
            self.running_length[replica] = 0;

            debug!(?report, "Episode finished");
            if let Err(e) = Self::append_episode(&self.report_dir, &report) {
                warn!("Could not append episode report: {:#}", e);
            }
            self.episodes_completed += 1;
            self.return_sum += report.episode_return;
            self.length_sum += report.length;
            if report.crashed {
                self.crashes += 1;
            }
        }
        Ok(true)
    }

    fn on_training_end(&mut self, end: &TrainingEnd<'_>) -> Result<()> {
        let summary = self.summary(end.num_steps, end.num_timesteps);
        let path = self.report_dir.join(SUMMARY_FILE);
        let written = serde_json::to_vec_pretty(&summary)
            .map_err(anyhow::Error::from)
            .and_then(|body| std::fs::write(&path, body).map_err(anyhow::Error::from));
        match written {
            Ok(()) => info!("Training report written to {:?}", path),
            Err(e) => warn!("Could not write training summary {:?}: {:#}", path, e),
        }
        Ok(())
    }
}

/// Streams scalar training metrics to TensorBoard event files in the
/// experiment's `tensorboard` directory. Never fails training: a stream that
/// cannot be opened is logged and skipped.
pub struct MetricsCallback {
    log_interval: u64,
    writer: Option<ScalarLog>,
    reward_sum: f64,
    reward_count: u64,
    episodes_done: u64,
}

impl MetricsCallback {
    pub fn new(log_interval: u64) -> Self {
        Self {
            log_interval: log_interval.max(1),
            writer: None,
            reward_sum: 0.0,
            reward_count: 0,
            episodes_done: 0,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.writer.is_some()
    }

    fn emit(&mut self, tag: &str, step: u64, value: f64) {
        if let Some(writer) = self.writer.as_mut() {
            writer.add_scalar(tag, step, value);
        }
    }
}

impl TrainingCallback for MetricsCallback {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_training_start(&mut self, experiment: &Experiment) -> Result<()> {
        match ScalarLog::open(&experiment.tensorboard_dir) {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => warn!("Metric stream disabled: {:#}", e),
        }
        Ok(())
    }

    fn on_step(&mut self, ctx: &StepContext<'_>) -> Result<bool> {
        for outcome in ctx.transitions {
            self.reward_sum += outcome.reward;
            self.reward_count += 1;
            if outcome.done {
                self.episodes_done += 1;
            }
        }

        if let Some(stats) = ctx.update {
            for (tag, value) in stats {
                self.emit(tag, ctx.num_timesteps, *value);
            }
        }

        if ctx.num_steps % self.log_interval == 0 {
            let mean_reward = self.reward_sum / self.reward_count.max(1) as f64;
            self.emit("rollout/mean_step_reward", ctx.num_timesteps, mean_reward);
            self.emit("rollout/episodes", ctx.num_timesteps, self.episodes_done as f64);
            self.emit("time/num_steps", ctx.num_timesteps, ctx.num_steps as f64);
            info!(
                steps = ctx.num_steps,
                timesteps = ctx.num_timesteps,
                mean_reward,
                episodes = self.episodes_done,
                "Training progress"
            );
            self.reward_sum = 0.0;
            self.reward_count = 0;
        }
        Ok(true)
    }

    fn on_training_end(&mut self, _end: &TrainingEnd<'_>) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush();
        }
        Ok(())
    }
}
