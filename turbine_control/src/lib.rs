//! Turbine Control - Core Library
//!
//! Closed-loop simulation of a floating wind turbine's stabilisation problem,
//! and orchestration of policy training over a pool of parallel environments.

pub mod agent;
pub mod callbacks;
pub mod cancel;
pub mod cli;
pub mod controller;
pub mod environment;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod runner;
pub mod settings;
pub mod simulator;
pub mod state;
pub mod telemetry;
pub mod trajectory;

pub use agent::{Agent, AgentLoader, Checkpointable, Policy};
pub use controller::Controller;
pub use environment::Environment;
pub use orchestrator::{Orchestrator, TrainingConfig, TrainingOutcome};
pub use simulator::{simulate_episode, EpisodeSimulator};
