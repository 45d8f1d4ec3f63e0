//! End-to-end tests: episode simulation with both controllers, trajectory
//! persistence, and short training runs feeding a simulated agent.

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use tracing_test::traced_test;
use turbine_control::{
    agent::{Agent, AgentConfig, AgentLoader, Checkpointable, LinearGaussianAgent, StopReason},
    callbacks::{CallbackList, CheckpointCallback, MetricsCallback},
    cancel::CancellationToken,
    controller::{ControllerKind, GainFeedback, GainMatrix, LearnedPolicy},
    environment::{EnvConfig, TurbineStabEnv},
    lifecycle::{Experiment, AGENTS_DIR, MANIFEST_FILE, REPORT_DIR, TENSORBOARD_DIR},
    metrics::event_files,
    pool::EnvPool,
    simulate_episode,
    state::{ACTION_DIM, STATE_DIM, TABLE_WIDTH},
    trajectory::{save_table, OutputLocation, TrajectoryTable},
    Environment, Orchestrator, TrainingConfig,
};

fn quiet_env() -> TurbineStabEnv {
    TurbineStabEnv::new(EnvConfig {
        initial_state_spread: 0.0,
        disturbance_amplitude: 0.0,
        ..EnvConfig::default()
    })
    .unwrap()
}

fn lqr() -> GainFeedback {
    let mut rows = [[0.0; STATE_DIM]; ACTION_DIM];
    for (i, row) in rows.iter_mut().enumerate() {
        row[i] = 2.0;
    }
    GainFeedback::new(GainMatrix(rows), 1.0).unwrap()
}

fn sorted_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
#[traced_test]
fn test_equilibrium_single_step_episode() {
    let mut env = quiet_env();
    let step_size = env.step_size();
    let table = simulate_episode(&mut env, &lqr(), step_size).unwrap();

    assert_eq!(table.len(), 1);
    assert_eq!(table.columns().len(), TABLE_WIDTH);
    for label in ["Fa_1", "Fa_2", "Fa_3", "Fa_4", "x_1", "x_11", "x_1_dot"] {
        assert_eq!(table.column(label).unwrap(), vec![0.0], "column {label}");
    }
}

#[test]
#[traced_test]
fn test_lqr_damps_initial_offset() {
    let mut env = TurbineStabEnv::new(EnvConfig {
        disturbance_amplitude: 0.0,
        seed: 7,
        ..EnvConfig::default()
    })
    .unwrap();
    let table = simulate_episode(&mut env, &lqr(), 10.0).unwrap();

    assert_eq!(table.len(), 100);
    let x1 = table.column("x_1").unwrap();
    assert!(x1.last().unwrap().abs() < 0.05);
}

#[test]
#[traced_test]
fn test_repeated_saves_never_overwrite() {
    let logs = tempdir().unwrap();
    let location = OutputLocation::for_lqr(logs.path());
    let mut env = quiet_env();
    let long = simulate_episode(&mut env, &lqr(), 0.5).unwrap();
    let short = simulate_episode(&mut env, &lqr(), 0.2).unwrap();

    let first = save_table(&long, &location.dir, &location.prefix).unwrap();
    let second = save_table(&short, &location.dir, &location.prefix).unwrap();

    assert_eq!(first.file_name().unwrap(), "_simdata_lqr_0.csv");
    assert_eq!(second.file_name().unwrap(), "_simdata_lqr_1.csv");
    assert_eq!(TrajectoryTable::read_csv(&first).unwrap(), long);
    assert_eq!(TrajectoryTable::read_csv(&second).unwrap(), short);
    assert_eq!((long.len(), short.len()), (5, 2));
}

#[test]
#[traced_test]
fn test_train_then_simulate_trained_agent() {
    let logs = tempdir().unwrap();
    let config = TrainingConfig {
        timesteps: 8,
        checkpoint_interval: 8,
        num_envs: Some(3),
        logs_root: logs.path().to_path_buf(),
        metrics_log_interval: 4,
        note: Some("integration".to_string()),
        ..TrainingConfig::default()
    };
    let env_config = EnvConfig {
        max_episode_time: 0.5,
        ..EnvConfig::default()
    };
    let agent_config = AgentConfig {
        rollout_length: 4,
        ..AgentConfig::default()
    };

    let outcome = Orchestrator::new(config)
        .run::<LinearGaussianAgent, _>(TurbineStabEnv::factory(env_config.clone()), &agent_config)
        .unwrap();

    let root = &outcome.experiment.root;
    assert!(outcome.experiment.id.ends_with("ppo"));
    for dir in [AGENTS_DIR, REPORT_DIR, TENSORBOARD_DIR] {
        assert!(root.join(dir).is_dir(), "{dir} missing");
    }
    assert_eq!(
        sorted_names(&root.join(AGENTS_DIR)),
        vec!["last_model_8.json", "rl_model_8_steps.json"]
    );
    let manifest = std::fs::read_to_string(root.join(MANIFEST_FILE)).unwrap();
    assert!(manifest.contains("\"step_size\""));
    assert!(manifest.contains("integration"));
    let streams = event_files(&root.join(TENSORBOARD_DIR)).unwrap();
    assert_eq!(streams.len(), 1);
    assert!(std::fs::metadata(&streams[0]).unwrap().len() > 0);

    let agent = LinearGaussianAgent::load(&outcome.final_checkpoint, Some(2 * STATE_DIM)).unwrap();
    assert_eq!(agent.num_timesteps(), 24);

    let mut env = TurbineStabEnv::new(env_config).unwrap();
    let controller: ControllerKind<LinearGaussianAgent> = ControllerKind::Agent(LearnedPolicy::new(agent));
    let table = simulate_episode(&mut env, &controller, 50.0).unwrap();
    assert_eq!(table.len(), 5);

    let location = OutputLocation::for_agent(logs.path(), &outcome.final_checkpoint).unwrap();
    assert_eq!(location.dir, root.join("sim_data"));
    assert_eq!(location.prefix, "_simdata_last_model_8");
    let saved = save_table(&table, &location.dir, &location.prefix).unwrap();
    assert!(saved.starts_with(root));
}

#[test]
#[traced_test]
fn test_cancelled_training_keeps_its_checkpoint() {
    let logs = tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = Orchestrator::new(TrainingConfig {
        timesteps: 1_000,
        num_envs: Some(1),
        logs_root: logs.path().to_path_buf(),
        ..TrainingConfig::default()
    })
    .with_cancellation(cancel)
    .run::<LinearGaussianAgent, _>(TurbineStabEnv::factory(EnvConfig::default()), &AgentConfig::default())
    .unwrap();

    assert!(outcome.cancelled);
    assert!(outcome.final_checkpoint.ends_with("last_model_0.json"));
    assert!(outcome.final_checkpoint.exists());
}

#[test]
#[traced_test]
fn test_failing_replica_aborts_training() {
    let logs = tempdir().unwrap();
    let factory: turbine_control::environment::EnvFactory<TurbineStabEnv> = Arc::new(|i: usize| {
        if i == 1 {
            anyhow::bail!("replica {i} unavailable");
        }
        TurbineStabEnv::new(EnvConfig::default())
    });
    let result = Orchestrator::new(TrainingConfig {
        timesteps: 10,
        num_envs: Some(2),
        logs_root: logs.path().to_path_buf(),
        ..TrainingConfig::default()
    })
    .run::<LinearGaussianAgent, _>(factory, &AgentConfig::default());
    assert!(result.is_err());
}

#[test]
#[traced_test]
fn test_training_completes_without_metric_stream() {
    let logs = tempdir().unwrap();
    let mut experiment = Experiment::create(logs.path(), "ppo").unwrap();
    let blocked = logs.path().join("tensorboard_blocked");
    std::fs::write(&blocked, "not a directory").unwrap();
    experiment.tensorboard_dir = blocked;

    let mut pool = EnvPool::new(2, TurbineStabEnv::factory(EnvConfig::default())).unwrap();
    let mut callbacks = CallbackList::new()
        .with(CheckpointCallback::new(3, &experiment.agents_dir))
        .with(MetricsCallback::new(1));
    let agent_config = AgentConfig {
        rollout_length: 2,
        ..AgentConfig::default()
    };
    let mut agent = LinearGaussianAgent::create(pool.observation_dim(), &agent_config).unwrap();

    let summary = agent
        .learn(&mut pool, 6, &mut callbacks, &experiment, &CancellationToken::new())
        .unwrap();
    pool.close();

    assert_eq!(summary.steps, 6);
    assert_eq!(summary.reason, StopReason::BudgetExhausted);
    assert_eq!(
        sorted_names(&experiment.agents_dir),
        vec!["rl_model_3_steps.json", "rl_model_6_steps.json"]
    );
    assert!(logs_contain("Metric stream disabled"));
}
