//! Shared data model: state, action and per-step outcome types.

use serde::{Deserialize, Serialize};

/// Number of physical state variables exposed by the structure.
pub const STATE_DIM: usize = 11;

/// Number of actuator force commands.
pub const ACTION_DIM: usize = 4;

/// Total column count of a trajectory table: time, states, derivatives, inputs, reward.
pub const TABLE_WIDTH: usize = 1 + 2 * STATE_DIM + ACTION_DIM + 1;

pub type StateVector = [f64; STATE_DIM];
pub type Action = [f64; ACTION_DIM];
pub type Observation = Vec<f64>;

/// Column labels in their fixed persisted order.
pub fn column_labels() -> Vec<String> {
    let mut labels = Vec::with_capacity(TABLE_WIDTH);
    labels.push("time".to_string());
    labels.extend((1..=STATE_DIM).map(|i| format!("x_{i}")));
    labels.extend((1..=STATE_DIM).map(|i| format!("x_{i}_dot")));
    labels.extend((1..=ACTION_DIM).map(|i| format!("Fa_{i}")));
    labels.push("reward".to_string());
    labels
}

/// Physical quantities reported by the environment after one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Simulated time after the step, in seconds.
    pub time: f64,
    pub state: StateVector,
    pub state_dot: StateVector,
    /// Action as applied, after any clipping by the environment.
    pub action: Action,
    /// The step ended the episode through a failure condition rather than the time cap.
    pub crashed: bool,
}

/// Result of advancing one environment by one fixed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
    /// Last observation of a finished episode when the pool auto-reset the replica.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_observation: Option<Observation>,
}
