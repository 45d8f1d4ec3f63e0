//! Per-step controllers: fixed-gain state feedback and learned-policy query.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::agent::Policy;
use crate::state::{Action, StateVector, ACTION_DIM, STATE_DIM};

/// One controller is active for a whole episode and is called once per step.
pub trait Controller {
    fn name(&self) -> &str;

    /// Produce the action for the current step.
    fn compute_action(&self, observation: &[f64], state: &StateVector) -> Result<Action>;
}

/// Constant feedback gain, `ACTION_DIM x STATE_DIM`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainMatrix(pub [[f64; STATE_DIM]; ACTION_DIM]);

impl GainMatrix {
    /// Read the matrix stored under `key` in a JSON document.
    pub fn from_json_file(path: &Path, key: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gain matrix file: {:?}", path))?;
        let document: serde_json::Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse gain matrix file: {:?}", path))?;
        let entry = document
            .get(key)
            .ok_or_else(|| anyhow!("Gain matrix '{}' not found in {:?}", key, path))?;
        let rows: Vec<Vec<f64>> = serde_json::from_value(entry.clone())
            .with_context(|| format!("Gain matrix '{}' in {:?} is not a numeric matrix", key, path))?;
        Self::from_rows(&rows)
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        if rows.len() != ACTION_DIM {
            bail!("gain matrix must have {} rows, found {}", ACTION_DIM, rows.len());
        }
        let mut matrix = [[0.0; STATE_DIM]; ACTION_DIM];
        for (i, row) in rows.iter().enumerate() {
            if row.len() != STATE_DIM {
                bail!("gain matrix row {} must have {} columns, found {}", i, STATE_DIM, row.len());
            }
            if row.iter().any(|k| !k.is_finite()) {
                bail!("gain matrix row {} contains a non-finite entry", i);
            }
            matrix[i].copy_from_slice(row);
        }
        Ok(Self(matrix))
    }

    fn apply(&self, state: &StateVector) -> Action {
        let mut out = [0.0; ACTION_DIM];
        for (value, row) in out.iter_mut().zip(self.0.iter()) {
            *value = row.iter().zip(state.iter()).map(|(k, x)| k * x).sum();
        }
        out
    }
}

/// `u = -(K x) / max_input`.
#[derive(Debug, Clone)]
pub struct GainFeedback {
    gain: Arc<GainMatrix>,
    max_input: f64,
}

impl GainFeedback {
    pub fn new(gain: GainMatrix, max_input: f64) -> Result<Self> {
        if !(max_input > 0.0) {
            bail!("max input scale must be positive, got {}", max_input);
        }
        Ok(Self {
            gain: Arc::new(gain),
            max_input,
        })
    }

    /// Load the gain once; a missing or malformed source is a configuration error.
    pub fn from_file(path: &Path, key: &str, max_input: f64) -> Result<Self> {
        let gain = GainMatrix::from_json_file(path, key)
            .context("Invalid controller configuration")?;
        info!("Loaded feedback gain '{}' from {:?}", key, path);
        Self::new(gain, max_input)
    }

    pub fn gain(&self) -> &GainMatrix {
        &self.gain
    }
}

impl Controller for GainFeedback {
    fn name(&self) -> &str {
        "lqr"
    }

    fn compute_action(&self, _observation: &[f64], state: &StateVector) -> Result<Action> {
        let mut action = self.gain.apply(state);
        for value in action.iter_mut() {
            *value = -*value / self.max_input;
        }
        Ok(action)
    }
}

/// Queries a trained policy in deterministic mode.
pub struct LearnedPolicy<P> {
    policy: P,
}

impl<P: Policy> LearnedPolicy<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    pub fn into_inner(self) -> P {
        self.policy
    }
}

impl<P: Policy> Controller for LearnedPolicy<P> {
    fn name(&self) -> &str {
        "agent"
    }

    fn compute_action(&self, observation: &[f64], _state: &StateVector) -> Result<Action> {
        self.policy.predict(observation, true)
    }
}

/// Controller selected for an episode.
pub enum ControllerKind<P> {
    Lqr(GainFeedback),
    Agent(LearnedPolicy<P>),
}

impl<P: Policy> Controller for ControllerKind<P> {
    fn name(&self) -> &str {
        match self {
            ControllerKind::Lqr(c) => c.name(),
            ControllerKind::Agent(c) => c.name(),
        }
    }

    fn compute_action(&self, observation: &[f64], state: &StateVector) -> Result<Action> {
        match self {
            ControllerKind::Lqr(c) => c.compute_action(observation, state),
            ControllerKind::Agent(c) => c.compute_action(observation, state),
        }
    }
}
