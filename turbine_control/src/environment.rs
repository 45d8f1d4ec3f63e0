//! Environment contract and the built-in tower stabilisation environment.
//!
//! The simulator and the training pool only depend on [`Environment`]. The
//! [`TurbineStabEnv`] shipped here is a linear state-space stand-in so that
//! both run modes work end to end; a higher fidelity structural model can be
//! dropped in behind the same trait.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::{Action, Observation, StateVector, StepInfo, StepOutcome, ACTION_DIM, STATE_DIM};

/// A stateful, fixed-step simulated system.
pub trait Environment: Send {
    /// Return to the initial condition and produce the first observation.
    fn reset(&mut self) -> Observation;

    /// Apply `action` for one fixed step.
    fn step(&mut self, action: &Action) -> Result<StepOutcome>;

    /// Observation the controller should act on next.
    fn observation(&self) -> Observation;

    /// Raw physical state, as consumed by state-feedback control.
    fn state(&self) -> &StateVector;

    /// Whether the current episode has ended.
    fn is_done(&self) -> bool;

    /// Steps executed since the last reset.
    fn t_step(&self) -> u64;

    /// Fixed integration step, in seconds.
    fn step_size(&self) -> f64;

    fn time(&self) -> f64 {
        self.t_step() as f64 * self.step_size()
    }

    fn observation_dim(&self) -> usize {
        self.observation().len()
    }

    /// Serializable configuration, recorded in experiment manifests.
    fn config_snapshot(&self) -> serde_json::Value;
}

/// Builds one environment replica; the argument is the replica index.
pub type EnvFactory<E> = Arc<dyn Fn(usize) -> Result<E> + Send + Sync>;

/// Configuration of the built-in environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    pub step_size: f64,
    /// Episode length cap, in simulated seconds.
    pub max_episode_time: f64,
    /// Actuator force corresponding to a unit action.
    pub max_input: f64,
    /// Uniform half-width of the random initial state.
    pub initial_state_spread: f64,
    /// Linear damping applied to every state.
    pub damping: f64,
    /// Coupling between neighbouring states.
    pub coupling: f64,
    pub input_gain: f64,
    pub disturbance_amplitude: f64,
    /// Disturbance angular frequency, rad/s.
    pub disturbance_frequency: f64,
    /// Absolute state value beyond which the structure is considered lost.
    pub crash_threshold: f64,
    pub crash_penalty: f64,
    pub state_weight: f64,
    pub input_weight: f64,
    pub seed: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            step_size: 0.1,
            max_episode_time: 300.0,
            max_input: 1.0,
            initial_state_spread: 0.5,
            damping: 0.05,
            coupling: 0.02,
            input_gain: 1.0,
            disturbance_amplitude: 0.2,
            disturbance_frequency: 0.6,
            crash_threshold: 20.0,
            crash_penalty: 100.0,
            state_weight: 0.1,
            input_weight: 0.01,
            seed: 0,
        }
    }
}

impl EnvConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size > 0.0) {
            bail!("environment step_size must be positive, got {}", self.step_size);
        }
        if !(self.max_input > 0.0) {
            bail!("environment max_input must be positive, got {}", self.max_input);
        }
        if !(self.crash_threshold > 0.0) {
            bail!("environment crash_threshold must be positive, got {}", self.crash_threshold);
        }
        Ok(())
    }
}

/// Linear state-space tower model with a periodic wind disturbance.
///
/// `x_dot = A x + B (u * max_input) + d(t)` integrated with explicit Euler.
pub struct TurbineStabEnv {
    config: EnvConfig,
    rng: StdRng,
    state: StateVector,
    state_dot: StateVector,
    t_step: u64,
    done: bool,
}

impl TurbineStabEnv {
    pub fn new(config: EnvConfig) -> Result<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        let mut env = Self {
            config,
            rng,
            state: [0.0; STATE_DIM],
            state_dot: [0.0; STATE_DIM],
            t_step: 0,
            done: false,
        };
        env.reset();
        Ok(env)
    }

    /// Replica factory for the training pool; each replica gets its own seed.
    pub fn factory(config: EnvConfig) -> EnvFactory<Self> {
        Arc::new(move |index| {
            let mut replica = config.clone();
            replica.seed = config.seed.wrapping_add(index as u64);
            Self::new(replica)
        })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn state_dot(&self) -> &StateVector {
        &self.state_dot
    }

    fn derivative(&self, state: &StateVector, force: &Action, time: f64) -> StateVector {
        let c = &self.config;
        let wind = c.disturbance_amplitude * (c.disturbance_frequency * time).sin();
        let mut dot = [0.0; STATE_DIM];
        for i in 0..STATE_DIM {
            let left = if i > 0 { state[i - 1] } else { 0.0 };
            let right = if i + 1 < STATE_DIM { state[i + 1] } else { 0.0 };
            dot[i] = -c.damping * state[i] + c.coupling * (left + right - 2.0 * state[i])
                + c.input_gain * force[i % ACTION_DIM];
        }
        // tower top fore-aft and side-side take the wind load
        dot[0] += wind;
        dot[1] += 0.5 * wind;
        dot
    }

    fn reward(&self, action: &Action) -> f64 {
        let c = &self.config;
        let state_cost: f64 = self.state.iter().map(|x| x * x).sum();
        let input_cost: f64 = action.iter().map(|u| u * u).sum();
        1.0 - c.state_weight * state_cost - c.input_weight * input_cost
    }
}

impl Environment for TurbineStabEnv {
    fn reset(&mut self) -> Observation {
        let spread = self.config.initial_state_spread;
        for x in self.state.iter_mut() {
            *x = if spread > 0.0 { self.rng.gen_range(-spread..=spread) } else { 0.0 };
        }
        self.t_step = 0;
        self.done = false;
        self.state_dot = self.derivative(&self.state, &[0.0; ACTION_DIM], 0.0);
        self.observation()
    }

    fn step(&mut self, action: &Action) -> Result<StepOutcome> {
        if self.done {
            bail!("step called on a finished episode at t_step {}", self.t_step);
        }
        if action.iter().any(|a| !a.is_finite()) {
            bail!("non-finite action {:?}", action);
        }

        let mut applied = [0.0; ACTION_DIM];
        let mut force = [0.0; ACTION_DIM];
        for i in 0..ACTION_DIM {
            applied[i] = action[i].clamp(-1.0, 1.0);
            force[i] = applied[i] * self.config.max_input;
        }

        let time = self.time();
        let dot = self.derivative(&self.state, &force, time);
        for i in 0..STATE_DIM {
            self.state[i] += self.config.step_size * dot[i];
        }
        self.state_dot = dot;
        self.t_step += 1;

        let crashed = self.state.iter().any(|x| x.abs() > self.config.crash_threshold);
        let timed_out = self.time() >= self.config.max_episode_time;
        self.done = crashed || timed_out;

        let reward = if crashed {
            -self.config.crash_penalty
        } else {
            self.reward(&applied)
        };

        Ok(StepOutcome {
            observation: self.observation(),
            reward,
            done: self.done,
            info: StepInfo {
                time: self.time(),
                state: self.state,
                state_dot: self.state_dot,
                action: applied,
                crashed,
            },
            terminal_observation: None,
        })
    }

    fn observation(&self) -> Observation {
        self.state.iter().chain(self.state_dot.iter()).copied().collect()
    }

    fn state(&self) -> &StateVector {
        &self.state
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn t_step(&self) -> u64 {
        self.t_step
    }

    fn step_size(&self) -> f64 {
        self.config.step_size
    }

    fn config_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }
}
