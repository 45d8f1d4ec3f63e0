//! Learning agent contract and the built-in linear Gaussian policy agent.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::callbacks::{CallbackList, StepContext, TrainingEnd};
use crate::cancel::CancellationToken;
use crate::lifecycle::Experiment;
use crate::pool::EnvPool;
use crate::state::{Action, Observation, StepOutcome, ACTION_DIM};

/// Scalar diagnostics produced by a parameter update, keyed by metric name.
pub type UpdateStats = BTreeMap<String, f64>;

/// Anything that maps an observation to an action.
pub trait Policy: Send + Sync {
    /// `deterministic` disables exploration noise.
    fn predict(&self, observation: &[f64], deterministic: bool) -> Result<Action>;
}

impl<P: Policy + ?Sized> Policy for Box<P> {
    fn predict(&self, observation: &[f64], deterministic: bool) -> Result<Action> {
        (**self).predict(observation, deterministic)
    }
}

/// Learnable parameters that can be written out as a checkpoint.
pub trait Checkpointable {
    /// Write a new checkpoint file at `path`; an existing file is never replaced.
    fn save(&self, path: &Path) -> Result<PathBuf>;

    /// Environment transitions consumed so far.
    fn num_timesteps(&self) -> u64;
}

/// Why a call to [`Agent::learn`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    CallbackRequested,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnSummary {
    pub steps: u64,
    pub num_timesteps: u64,
    pub reason: StopReason,
}

pub trait Agent: Policy + Checkpointable {
    /// Consume one synchronized batch of transitions, one per pool replica.
    fn observe(
        &mut self,
        observations: &[Observation],
        actions: &[Action],
        outcomes: &[StepOutcome],
    ) -> Result<Option<UpdateStats>>;

    /// Run the rollout loop for `total_steps` pool steps, calling every
    /// observer after each step.
    #[instrument(skip_all, fields(total_steps = total_steps))]
    fn learn(
        &mut self,
        pool: &mut EnvPool,
        total_steps: u64,
        callbacks: &mut CallbackList,
        experiment: &Experiment,
        cancel: &CancellationToken,
    ) -> Result<LearnSummary>
    where
        Self: Sized,
    {
        let mut observations = pool.reset()?;
        callbacks.on_training_start(experiment)?;

        let mut steps = 0u64;
        let mut reason = StopReason::BudgetExhausted;
        while steps < total_steps {
            if cancel.is_cancelled() {
                reason = StopReason::Cancelled;
                break;
            }

            let actions = observations
                .iter()
                .map(|obs| self.predict(obs, false))
                .collect::<Result<Vec<_>>>()?;
            let outcomes = pool.step(&actions)?;
            steps += 1;

            let update = self.observe(&observations, &actions, &outcomes)?;
            observations = outcomes.iter().map(|o| o.observation.clone()).collect();

            let ctx = StepContext {
                num_steps: steps,
                num_timesteps: self.num_timesteps(),
                transitions: &outcomes,
                agent: &*self,
                experiment,
                update: update.as_ref(),
            };
            if !callbacks.on_step(&ctx)? {
                reason = StopReason::CallbackRequested;
                break;
            }
        }

        callbacks.on_training_end(&TrainingEnd {
            num_steps: steps,
            num_timesteps: self.num_timesteps(),
            experiment,
        })?;

        info!(steps, ?reason, "Learning loop finished");
        Ok(LearnSummary {
            steps,
            num_timesteps: self.num_timesteps(),
            reason,
        })
    }
}

/// Construction paths for an agent bound to a pool's observation size.
pub trait AgentLoader: Agent + Sized {
    type Config;

    fn create(observation_dim: usize, config: &Self::Config) -> Result<Self>;

    /// Restore a checkpoint to continue training or to run it as a controller.
    fn load(path: &Path, observation_dim: Option<usize>) -> Result<Self>;
}

/// Hyper-parameters of the built-in agent (JSON/TOML loadable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub learning_rate: f64,
    pub gamma: f64,
    /// Pool steps collected before each update.
    pub rollout_length: usize,
    pub log_std_init: f64,
    pub max_grad_norm: f64,
    pub seed: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            gamma: 0.99,
            rollout_length: 256,
            log_std_init: -0.5,
            max_grad_norm: 0.5,
            seed: 0,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rollout_length == 0 {
            bail!("agent rollout_length must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            bail!("agent gamma must lie in [0, 1], got {}", self.gamma);
        }
        if !(self.learning_rate > 0.0) {
            bail!("agent learning_rate must be positive, got {}", self.learning_rate);
        }
        Ok(())
    }
}

const CHECKPOINT_VERSION: u32 = 1;
const LOG_STD_MIN: f64 = -5.0;
const LOG_STD_MAX: f64 = 1.0;

/// On-disk layout of a [`LinearGaussianAgent`] checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AgentCheckpoint {
    version: u32,
    observation_dim: usize,
    weights: Vec<Vec<f64>>,
    bias: Action,
    log_std: Action,
    num_timesteps: u64,
    config: AgentConfig,
}

#[derive(Debug, Clone)]
struct Transition {
    observation: Observation,
    action: Action,
    reward: f64,
    done: bool,
}

/// Linear Gaussian policy `a ~ N(W o + b, exp(log_std)^2)` trained with
/// REINFORCE and a mean-return baseline over fixed-length rollouts.
pub struct LinearGaussianAgent {
    config: AgentConfig,
    observation_dim: usize,
    weights: Vec<Vec<f64>>,
    bias: Action,
    log_std: Action,
    num_timesteps: u64,
    rng: Mutex<StdRng>,
    /// One transition buffer per pool replica.
    rollout: Vec<Vec<Transition>>,
    rollout_steps: usize,
}

impl LinearGaussianAgent {
    pub fn new(observation_dim: usize, config: AgentConfig) -> Result<Self> {
        config.validate()?;
        if observation_dim == 0 {
            bail!("observation dimension must be positive");
        }
        Ok(Self {
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            observation_dim,
            weights: vec![vec![0.0; observation_dim]; ACTION_DIM],
            bias: [0.0; ACTION_DIM],
            log_std: [config.log_std_init; ACTION_DIM],
            num_timesteps: 0,
            rollout: Vec::new(),
            rollout_steps: 0,
            config,
        })
    }

    pub fn observation_dim(&self) -> usize {
        self.observation_dim
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn mean(&self, observation: &[f64]) -> Action {
        let mut mean = self.bias;
        for (m, row) in mean.iter_mut().zip(self.weights.iter()) {
            *m += row.iter().zip(observation.iter()).map(|(w, o)| w * o).sum::<f64>();
        }
        mean
    }

    fn standard_normal(rng: &mut StdRng) -> f64 {
        // Box-Muller; u1 in (0, 1] keeps the log finite
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn update(&mut self) -> UpdateStats {
        let gamma = self.config.gamma;
        let mut samples: Vec<(&Transition, f64)> = Vec::new();
        let mut reward_sum = 0.0;
        let mut reward_count = 0usize;

        for buffer in &self.rollout {
            let mut ret = 0.0;
            let mut returns = vec![0.0; buffer.len()];
            for (i, t) in buffer.iter().enumerate().rev() {
                if t.done {
                    ret = 0.0;
                }
                ret = t.reward + gamma * ret;
                returns[i] = ret;
            }
            for (t, r) in buffer.iter().zip(returns) {
                reward_sum += t.reward;
                reward_count += 1;
                samples.push((t, r));
            }
        }

        let n = samples.len().max(1) as f64;
        let mean_return = samples.iter().map(|(_, r)| r).sum::<f64>() / n;
        let var = samples.iter().map(|(_, r)| (r - mean_return).powi(2)).sum::<f64>() / n;
        let scale = var.sqrt().max(1e-8);

        let mut grad_w = vec![vec![0.0; self.observation_dim]; ACTION_DIM];
        let mut grad_b = [0.0; ACTION_DIM];
        let mut grad_log_std = [0.0; ACTION_DIM];
        for (t, ret) in &samples {
            let advantage = (ret - mean_return) / scale;
            let mean = self.mean(&t.observation);
            for k in 0..ACTION_DIM {
                let var_k = (2.0 * self.log_std[k]).exp();
                let diff = t.action[k] - mean[k];
                let g_mean = advantage * diff / var_k;
                for (g, o) in grad_w[k].iter_mut().zip(t.observation.iter()) {
                    *g += g_mean * o / n;
                }
                grad_b[k] += g_mean / n;
                grad_log_std[k] += advantage * (diff * diff / var_k - 1.0) / n;
            }
        }

        let norm = (grad_w.iter().flatten().map(|g| g * g).sum::<f64>()
            + grad_b.iter().map(|g| g * g).sum::<f64>()
            + grad_log_std.iter().map(|g| g * g).sum::<f64>())
        .sqrt();
        let clip = if norm > self.config.max_grad_norm && norm > 0.0 {
            self.config.max_grad_norm / norm
        } else {
            1.0
        };
        let step = self.config.learning_rate * clip;

        for k in 0..ACTION_DIM {
            for (w, g) in self.weights[k].iter_mut().zip(grad_w[k].iter()) {
                *w += step * g;
            }
            self.bias[k] += step * grad_b[k];
            self.log_std[k] = (self.log_std[k] + step * grad_log_std[k]).clamp(LOG_STD_MIN, LOG_STD_MAX);
        }

        for buffer in self.rollout.iter_mut() {
            buffer.clear();
        }
        self.rollout_steps = 0;

        let mut stats = UpdateStats::new();
        stats.insert("train/mean_step_reward".into(), reward_sum / reward_count.max(1) as f64);
        stats.insert("train/mean_return".into(), mean_return);
        stats.insert("train/grad_norm".into(), norm);
        stats.insert(
            "train/std".into(),
            self.log_std.iter().map(|l| l.exp()).sum::<f64>() / ACTION_DIM as f64,
        );
        debug!(?stats, "Policy updated");
        stats
    }
}

impl Policy for LinearGaussianAgent {
    fn predict(&self, observation: &[f64], deterministic: bool) -> Result<Action> {
        if observation.len() != self.observation_dim {
            bail!(
                "observation has {} values, policy expects {}",
                observation.len(),
                self.observation_dim
            );
        }
        let mut action = self.mean(observation);
        if !deterministic {
            let mut rng = self.rng.lock();
            for (a, log_std) in action.iter_mut().zip(self.log_std.iter()) {
                *a += log_std.exp() * Self::standard_normal(&mut rng);
            }
        }
        Ok(action.map(|a| a.clamp(-1.0, 1.0)))
    }
}

impl Checkpointable for LinearGaussianAgent {
    fn save(&self, path: &Path) -> Result<PathBuf> {
        let checkpoint = AgentCheckpoint {
            version: CHECKPOINT_VERSION,
            observation_dim: self.observation_dim,
            weights: self.weights.clone(),
            bias: self.bias,
            log_std: self.log_std,
            num_timesteps: self.num_timesteps,
            config: self.config.clone(),
        };
        let body = serde_json::to_vec_pretty(&checkpoint)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("Failed to create checkpoint: {:?}", path))?;
        file.write_all(&body)
            .and_then(|_| file.sync_all())
            .with_context(|| format!("Failed to write checkpoint: {:?}", path))?;
        info!("Saved agent checkpoint ({} timesteps) to {:?}", self.num_timesteps, path);
        Ok(path.to_path_buf())
    }

    fn num_timesteps(&self) -> u64 {
        self.num_timesteps
    }
}

impl Agent for LinearGaussianAgent {
    fn observe(
        &mut self,
        observations: &[Observation],
        actions: &[Action],
        outcomes: &[StepOutcome],
    ) -> Result<Option<UpdateStats>> {
        if observations.len() != outcomes.len() || actions.len() != outcomes.len() {
            bail!(
                "batch mismatch: {} observations, {} actions, {} outcomes",
                observations.len(),
                actions.len(),
                outcomes.len()
            );
        }
        if self.rollout.len() != outcomes.len() {
            self.rollout = vec![Vec::with_capacity(self.config.rollout_length); outcomes.len()];
            self.rollout_steps = 0;
        }

        for (i, outcome) in outcomes.iter().enumerate() {
            self.rollout[i].push(Transition {
                observation: observations[i].clone(),
                action: actions[i],
                reward: outcome.reward,
                done: outcome.done,
            });
        }
        self.num_timesteps += outcomes.len() as u64;
        self.rollout_steps += 1;

        if self.rollout_steps >= self.config.rollout_length {
            Ok(Some(self.update()))
        } else {
            Ok(None)
        }
    }
}

impl AgentLoader for LinearGaussianAgent {
    type Config = AgentConfig;

    fn create(observation_dim: usize, config: &AgentConfig) -> Result<Self> {
        Self::new(observation_dim, config.clone())
    }

    fn load(path: &Path, observation_dim: Option<usize>) -> Result<Self> {
        let contents = std::fs::read(path)
            .with_context(|| format!("Failed to read checkpoint: {:?}", path))?;
        let checkpoint: AgentCheckpoint = serde_json::from_slice(&contents)
            .with_context(|| format!("Failed to parse checkpoint: {:?}", path))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            bail!("Unsupported checkpoint version {} in {:?}", checkpoint.version, path);
        }
        if let Some(expected) = observation_dim {
            if expected != checkpoint.observation_dim {
                bail!(
                    "Checkpoint {:?} expects {} observations, environment provides {}",
                    path,
                    checkpoint.observation_dim,
                    expected
                );
            }
        }
        if checkpoint.weights.len() != ACTION_DIM
            || checkpoint.weights.iter().any(|row| row.len() != checkpoint.observation_dim)
        {
            return Err(anyhow!("Checkpoint {:?} has malformed weights", path));
        }

        let mut agent = Self::new(checkpoint.observation_dim, checkpoint.config)?;
        agent.weights = checkpoint.weights;
        agent.bias = checkpoint.bias;
        agent.log_std = checkpoint.log_std;
        agent.num_timesteps = checkpoint.num_timesteps;
        info!("Loaded agent checkpoint from {:?} ({} timesteps)", path, agent.num_timesteps);
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StepInfo, STATE_DIM};

    fn outcome(reward: f64, done: bool) -> StepOutcome {
        StepOutcome {
            observation: vec![0.5; 3],
            reward,
            done,
            info: StepInfo {
                time: 0.0,
                state: [0.0; STATE_DIM],
                state_dot: [0.0; STATE_DIM],
                action: [0.0; ACTION_DIM],
                crashed: false,
            },
            terminal_observation: None,
        }
    }

    fn trained_agent() -> LinearGaussianAgent {
        let config = AgentConfig {
            rollout_length: 2,
            learning_rate: 0.1,
            ..AgentConfig::default()
        };
        let mut agent = LinearGaussianAgent::new(3, config).unwrap();
        for step in 0..4 {
            let obs = vec![vec![1.0, -0.5, 0.25]; 2];
            let actions: Vec<Action> = obs.iter().map(|o| agent.predict(o, false).unwrap()).collect();
            let outcomes = vec![outcome(step as f64, false), outcome(-1.0, step == 1)];
            agent.observe(&obs, &actions, &outcomes).unwrap();
        }
        agent
    }

    #[test]
    fn test_untrained_deterministic_action_is_zero() {
        let agent = LinearGaussianAgent::new(3, AgentConfig::default()).unwrap();
        assert_eq!(agent.predict(&[1.0, 2.0, 3.0], true).unwrap(), [0.0; ACTION_DIM]);
    }

    #[test]
    fn test_rejects_wrong_observation_size() {
        let agent = LinearGaussianAgent::new(3, AgentConfig::default()).unwrap();
        assert!(agent.predict(&[1.0], true).is_err());
    }

    #[test]
    fn test_exploration_stays_in_bounds() {
        let agent = LinearGaussianAgent::new(2, AgentConfig::default()).unwrap();
        for _ in 0..100 {
            let a = agent.predict(&[0.3, 0.1], false).unwrap();
            assert!(a.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_update_after_rollout_length() {
        let config = AgentConfig {
            rollout_length: 2,
            ..AgentConfig::default()
        };
        let mut agent = LinearGaussianAgent::new(3, config).unwrap();
        let obs = vec![vec![1.0, 0.0, 0.0]];
        let actions = vec![[0.1; ACTION_DIM]];
        assert!(agent.observe(&obs, &actions, &[outcome(1.0, false)]).unwrap().is_none());
        let stats = agent.observe(&obs, &actions, &[outcome(2.0, true)]).unwrap().unwrap();
        assert!(stats.contains_key("train/mean_return"));
        assert_eq!(agent.num_timesteps(), 2);
    }

    #[test]
    fn test_save_load_reproduces_deterministic_actions() {
        let agent = trained_agent();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        agent.save(&path).unwrap();

        let loaded = LinearGaussianAgent::load(&path, Some(3)).unwrap();
        let obs = [0.7, -1.3, 2.0];
        let before = agent.predict(&obs, true).unwrap();
        let after = loaded.predict(&obs, true).unwrap();
        assert_eq!(before.map(f64::to_bits), after.map(f64::to_bits));
        assert_eq!(loaded.num_timesteps(), agent.num_timesteps());
    }

    #[test]
    fn test_save_never_overwrites() {
        let agent = LinearGaussianAgent::new(3, AgentConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        agent.save(&path).unwrap();
        assert!(agent.save(&path).is_err());
    }

    #[test]
    fn test_load_rejects_dimension_mismatch() {
        let agent = LinearGaussianAgent::new(3, AgentConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        agent.save(&path).unwrap();
        assert!(LinearGaussianAgent::load(&path, Some(22)).is_err());
        assert!(LinearGaussianAgent::load(&path, None).is_ok());
    }
}
