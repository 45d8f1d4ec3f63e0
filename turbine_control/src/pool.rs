//! Lockstep pool of independent environment replicas, one worker thread each.
//!
//! Every call fans a command out to all workers and then blocks until every
//! worker has answered, so replicas never drift apart by more than one step.
//! A replica whose episode ends is reset by its own worker before replying.
//! Any worker failure poisons the pool: the run cannot continue on a partial set.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::environment::{EnvFactory, Environment};
use crate::state::{Action, Observation, StepOutcome};

enum Command {
    Reset,
    Step(Action),
    Shutdown,
}

enum Reply {
    Reset(Observation),
    Step(StepOutcome),
}

struct Worker {
    index: usize,
    commands: Sender<Command>,
    replies: Receiver<Result<Reply, String>>,
    handle: Option<JoinHandle<()>>,
}

pub struct EnvPool {
    workers: Vec<Worker>,
    observation_dim: usize,
    config_snapshot: serde_json::Value,
    poisoned: bool,
}

impl EnvPool {
    /// Spawn `num_envs` replicas built by `factory`.
    #[instrument(skip(factory))]
    pub fn new<E: Environment + 'static>(num_envs: usize, factory: EnvFactory<E>) -> Result<Self> {
        if num_envs == 0 {
            bail!("environment pool needs at least one replica");
        }

        let envs = (0..num_envs)
            .map(|i| factory(i).with_context(|| format!("Failed to build environment replica {}", i)))
            .collect::<Result<Vec<_>>>()?;
        let observation_dim = envs[0].observation_dim();
        let config_snapshot = envs[0].config_snapshot();

        let mut workers = Vec::with_capacity(num_envs);
        for (index, env) in envs.into_iter().enumerate() {
            let (cmd_tx, cmd_rx) = channel::bounded::<Command>(1);
            let (reply_tx, reply_rx) = channel::bounded(1);
            let handle = std::thread::Builder::new()
                .name(format!("env-worker-{index}"))
                .spawn(move || worker_loop(env, cmd_rx, reply_tx))
                .with_context(|| format!("Failed to spawn environment worker {}", index))?;
            workers.push(Worker {
                index,
                commands: cmd_tx,
                replies: reply_rx,
                handle: Some(handle),
            });
        }

        info!("Started environment pool with {} replicas", num_envs);
        Ok(Self {
            workers,
            observation_dim,
            config_snapshot,
            poisoned: false,
        })
    }

    /// One replica per available compute unit.
    pub fn with_available_parallelism<E: Environment + 'static>(factory: EnvFactory<E>) -> Result<Self> {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(n, factory)
    }

    pub fn num_envs(&self) -> usize {
        self.workers.len()
    }

    pub fn observation_dim(&self) -> usize {
        self.observation_dim
    }

    /// Configuration of the first replica; all replicas share it.
    pub fn config_snapshot(&self) -> &serde_json::Value {
        &self.config_snapshot
    }

    pub fn reset(&mut self) -> Result<Vec<Observation>> {
        let replies = self.broadcast(|_| Command::Reset)?;
        replies
            .into_iter()
            .map(|reply| match reply {
                Reply::Reset(obs) => Ok(obs),
                Reply::Step(_) => Err(anyhow!("environment worker answered reset with a step")),
            })
            .collect()
    }

    /// Advance every replica by one step; `actions[i]` goes to replica `i`.
    pub fn step(&mut self, actions: &[Action]) -> Result<Vec<StepOutcome>> {
        if actions.len() != self.workers.len() {
            bail!(
                "got {} actions for {} environment replicas",
                actions.len(),
                self.workers.len()
            );
        }
        let replies = self.broadcast(|i| Command::Step(actions[i]))?;
        replies
            .into_iter()
            .map(|reply| match reply {
                Reply::Step(outcome) => Ok(outcome),
                Reply::Reset(_) => Err(anyhow!("environment worker answered step with a reset")),
            })
            .collect()
    }

    /// Stop and join all workers. Safe to call more than once.
    pub fn close(&mut self) {
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!("Environment worker {} panicked", worker.index);
                }
            }
        }
        debug!("Environment pool closed");
    }

    /// Send one command per worker, then wait for all replies (the barrier).
    fn broadcast(&mut self, command: impl Fn(usize) -> Command) -> Result<Vec<Reply>> {
        if self.poisoned {
            bail!("environment pool is unusable after a replica failure");
        }

        let delivered: Vec<bool> = self
            .workers
            .iter()
            .map(|w| w.commands.send(command(w.index)).is_ok())
            .collect();

        let mut replies = Vec::with_capacity(self.workers.len());
        let mut failure: Option<anyhow::Error> = None;
        for (worker, sent) in self.workers.iter().zip(delivered) {
            let reply = if sent {
                match worker.replies.recv() {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(message)) => Err(anyhow!("environment replica {} failed: {}", worker.index, message)),
                    Err(_) => Err(anyhow!("environment replica {} terminated unexpectedly", worker.index)),
                }
            } else {
                Err(anyhow!("environment replica {} is not running", worker.index))
            };
            match reply {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    error!("{:#}", e);
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            self.poisoned = true;
            return Err(e);
        }
        Ok(replies)
    }
}

impl Drop for EnvPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop<E: Environment>(
    mut env: E,
    commands: Receiver<Command>,
    replies: Sender<Result<Reply, String>>,
) {
    while let Ok(command) = commands.recv() {
        let reply = match command {
            Command::Reset => Ok(Reply::Reset(env.reset())),
            Command::Step(action) => match env.step(&action) {
                Ok(mut outcome) => {
                    if outcome.done {
                        let terminal = std::mem::replace(&mut outcome.observation, env.reset());
                        outcome.terminal_observation = Some(terminal);
                    }
                    Ok(Reply::Step(outcome))
                }
                Err(e) => Err(format!("{:#}", e)),
            },
            Command::Shutdown => break,
        };
        let failed = reply.is_err();
        if replies.send(reply).is_err() || failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvConfig, TurbineStabEnv};
    use crate::state::{StateVector, StepInfo, ACTION_DIM, STATE_DIM};
    use std::sync::Arc;

    /// Counts steps and ends its episode every `episode_len` steps.
    struct CountingEnv {
        steps: u64,
        episode_len: u64,
        fail_at: Option<u64>,
        state: StateVector,
    }

    impl Environment for CountingEnv {
        fn reset(&mut self) -> Observation {
            self.steps = 0;
            vec![0.0]
        }

        fn step(&mut self, action: &Action) -> Result<StepOutcome> {
            self.steps += 1;
            if self.fail_at == Some(self.steps) {
                bail!("solver diverged");
            }
            Ok(StepOutcome {
                observation: vec![self.steps as f64],
                reward: action[0],
                done: self.steps >= self.episode_len,
                info: StepInfo {
                    time: self.steps as f64,
                    state: self.state,
                    state_dot: self.state,
                    action: *action,
                    crashed: false,
                },
                terminal_observation: None,
            })
        }

        fn observation(&self) -> Observation {
            vec![self.steps as f64]
        }

        fn state(&self) -> &StateVector {
            &self.state
        }

        fn is_done(&self) -> bool {
            self.steps >= self.episode_len
        }

        fn t_step(&self) -> u64 {
            self.steps
        }

        fn step_size(&self) -> f64 {
            1.0
        }

        fn config_snapshot(&self) -> serde_json::Value {
            serde_json::json!({ "episode_len": self.episode_len })
        }
    }

    fn counting_factory(episode_len: u64, failing_replica: Option<usize>) -> EnvFactory<CountingEnv> {
        Arc::new(move |i| {
            Ok(CountingEnv {
                steps: 0,
                episode_len,
                fail_at: if failing_replica == Some(i) { Some(2) } else { None },
                state: [0.0; STATE_DIM],
            })
        })
    }

    #[test]
    fn test_step_returns_one_outcome_per_replica_in_order() {
        let mut pool = EnvPool::new(3, counting_factory(10, None)).unwrap();
        assert_eq!(pool.reset().unwrap(), vec![vec![0.0]; 3]);

        let actions: Vec<Action> = (0..3).map(|i| [i as f64; ACTION_DIM]).collect();
        let outcomes = pool.step(&actions).unwrap();
        assert_eq!(outcomes.len(), 3);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.reward, i as f64);
            assert_eq!(outcome.observation, vec![1.0]);
        }
        assert_eq!(pool.config_snapshot()["episode_len"], 10);
    }

    #[test]
    fn test_finished_replicas_auto_reset() {
        let mut pool = EnvPool::new(2, counting_factory(2, None)).unwrap();
        pool.reset().unwrap();
        let actions = vec![[0.0; ACTION_DIM]; 2];
        pool.step(&actions).unwrap();
        let outcomes = pool.step(&actions).unwrap();
        for outcome in &outcomes {
            assert!(outcome.done);
            assert_eq!(outcome.terminal_observation, Some(vec![2.0]));
            assert_eq!(outcome.observation, vec![0.0]);
        }
        // next episode continues from the reset state
        let outcomes = pool.step(&actions).unwrap();
        assert!(outcomes.iter().all(|o| !o.done && o.observation == vec![1.0]));
    }

    #[test]
    fn test_replica_failure_is_fatal_for_the_pool() {
        let mut pool = EnvPool::new(3, counting_factory(10, Some(1))).unwrap();
        pool.reset().unwrap();
        let actions = vec![[0.0; ACTION_DIM]; 3];
        pool.step(&actions).unwrap();

        let err = pool.step(&actions).unwrap_err();
        assert!(err.to_string().contains("replica 1"));
        assert!(pool.step(&actions).is_err());
        assert!(pool.reset().is_err());
    }

    #[test]
    fn test_action_count_must_match() {
        let mut pool = EnvPool::new(2, counting_factory(10, None)).unwrap();
        assert!(pool.step(&[[0.0; ACTION_DIM]]).is_err());
    }

    #[test]
    fn test_zero_replicas_rejected() {
        assert!(EnvPool::new(0, counting_factory(10, None)).is_err());
    }

    #[test]
    fn test_available_parallelism_pool() {
        let mut pool = EnvPool::with_available_parallelism(TurbineStabEnv::factory(EnvConfig::default())).unwrap();
        assert!(pool.num_envs() >= 1);
        assert_eq!(pool.observation_dim(), 2 * STATE_DIM);
        let obs = pool.reset().unwrap();
        assert_eq!(obs.len(), pool.num_envs());
        pool.close();
        pool.close();
    }
}
