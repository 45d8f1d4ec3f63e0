//! Single-episode closed-loop simulation.

use anyhow::{bail, Result};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::controller::Controller;
use crate::environment::Environment;
use crate::trajectory::{TrajectoryRecord, TrajectoryRecorder, TrajectoryTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationPhase {
    Init,
    Running,
    Terminated,
}

/// Drives reset, then observe / act / step / record until the environment
/// finishes or simulated time reaches `max_time`.
pub struct EpisodeSimulator {
    max_time: f64,
    recorder: TrajectoryRecorder,
    phase: SimulationPhase,
    cancel: CancellationToken,
}

impl EpisodeSimulator {
    pub fn new(max_time: f64) -> Result<Self> {
        if !(max_time >= 0.0) {
            bail!("maximum simulation time must be non-negative, got {}", max_time);
        }
        Ok(Self {
            max_time,
            recorder: TrajectoryRecorder::new(),
            phase: SimulationPhase::Init,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn phase(&self) -> SimulationPhase {
        self.phase
    }

    pub fn max_time(&self) -> f64 {
        self.max_time
    }

    #[instrument(skip_all, fields(controller = controller.name(), max_time = self.max_time))]
    pub fn run<E, C>(&mut self, env: &mut E, controller: &C) -> Result<TrajectoryTable>
    where
        E: Environment + ?Sized,
        C: Controller + ?Sized,
    {
        self.phase = SimulationPhase::Init;
        self.recorder.clear();
        env.reset();
        debug!(step_size = env.step_size(), "Episode initialised");

        // a step starting exactly at max_time is excluded, one starting before it is run
        let step_limit = self.max_time / env.step_size();

        self.phase = SimulationPhase::Running;
        debug!(step_limit, "Episode running");
        while !env.is_done() && (env.t_step() as f64) < step_limit {
            if self.cancel.is_cancelled() {
                warn!("Episode cancelled at t = {:.3} s", env.time());
                break;
            }
            let observation = env.observation();
            let action = controller.compute_action(&observation, env.state())?;
            let outcome = env.step(&action)?;
            self.recorder.push(TrajectoryRecord::from_outcome(&outcome));
        }

        self.phase = SimulationPhase::Terminated;
        let table = self.recorder.finish();
        info!(
            steps = table.len(),
            sim_time = env.time(),
            done = env.is_done(),
            "Episode finished"
        );
        Ok(table)
    }
}

/// Run one episode of `controller` against `env`.
pub fn simulate_episode<E, C>(env: &mut E, controller: &C, max_time: f64) -> Result<TrajectoryTable>
where
    E: Environment + ?Sized,
    C: Controller + ?Sized,
{
    EpisodeSimulator::new(max_time)?.run(env, controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{GainFeedback, GainMatrix};
    use crate::environment::{EnvConfig, TurbineStabEnv};
    use crate::state::{Action, Observation, StateVector, StepOutcome, ACTION_DIM, STATE_DIM};
    use proptest::prelude::*;

    fn zero_gain() -> GainFeedback {
        GainFeedback::new(GainMatrix([[0.0; STATE_DIM]; ACTION_DIM]), 1.0).unwrap()
    }

    fn env(step_size: f64) -> TurbineStabEnv {
        TurbineStabEnv::new(EnvConfig {
            step_size,
            initial_state_spread: 0.1,
            ..EnvConfig::default()
        })
        .unwrap()
    }

    /// Signals completion immediately after reset.
    struct FinishedEnv {
        state: StateVector,
    }

    impl Environment for FinishedEnv {
        fn reset(&mut self) -> Observation {
            vec![]
        }
        fn step(&mut self, _action: &Action) -> Result<StepOutcome> {
            bail!("must not be stepped")
        }
        fn observation(&self) -> Observation {
            vec![]
        }
        fn state(&self) -> &StateVector {
            &self.state
        }
        fn is_done(&self) -> bool {
            true
        }
        fn t_step(&self) -> u64 {
            0
        }
        fn step_size(&self) -> f64 {
            0.1
        }
        fn config_snapshot(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    #[test]
    fn test_time_column_is_evenly_spaced() {
        let mut env = env(0.1);
        let mut sim = EpisodeSimulator::new(2.0).unwrap();
        let table = sim.run(&mut env, &zero_gain()).unwrap();

        assert_eq!(sim.phase(), SimulationPhase::Terminated);
        assert_eq!(table.len() as u64, env.t_step());
        let time = table.column("time").unwrap();
        for pair in time.windows(2) {
            assert!((pair[1] - pair[0] - 0.1).abs() < 1e-9);
        }
    }

    #[test]
    fn test_already_finished_environment_gives_empty_table() {
        let mut env = FinishedEnv { state: [0.0; STATE_DIM] };
        let table = simulate_episode(&mut env, &zero_gain(), 10.0).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.columns().len(), crate::state::TABLE_WIDTH);
    }

    #[test]
    fn test_environment_done_stops_early() {
        let mut env = TurbineStabEnv::new(EnvConfig {
            max_episode_time: 0.5,
            ..EnvConfig::default()
        })
        .unwrap();
        let table = simulate_episode(&mut env, &zero_gain(), 50.0).unwrap();
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_cancellation_stops_the_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sim = EpisodeSimulator::new(5.0).unwrap().with_cancellation(cancel);
        let table = sim.run(&mut env(0.1), &zero_gain()).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_rerun_starts_from_clean_recorder() {
        let mut env = env(0.1);
        let mut sim = EpisodeSimulator::new(0.3).unwrap();
        let first = sim.run(&mut env, &zero_gain()).unwrap();
        let second = sim.run(&mut env, &zero_gain()).unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn test_negative_max_time_rejected() {
        assert!(EpisodeSimulator::new(-1.0).is_err());
    }

    proptest! {
        #[test]
        fn never_exceeds_ceil_of_time_over_step(max_time in 0.0f64..3.0, step_index in 0usize..4) {
            let step_size = [0.01, 0.05, 0.1, 0.25][step_index];
            let mut env = env(step_size);
            let table = simulate_episode(&mut env, &zero_gain(), max_time).unwrap();
            let bound = (max_time / step_size).ceil() as usize;
            prop_assert!(table.len() <= bound);
            prop_assert_eq!(table.len() as u64, env.t_step());
        }
    }
}
