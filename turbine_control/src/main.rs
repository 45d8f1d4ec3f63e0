//! Main entry point for the turbine control CLI.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use turbine_control::{
    cancel::CancellationToken,
    cli,
    orchestrator::TrainingConfig,
    runner::{self, SimulationMode},
    settings::Settings,
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let settings = Settings::load_from(args.config.as_deref())?;

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    // Ctrl-C asks the running episode or training loop to wind down
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });

    // Execute the requested command
    match args.command {
        cli::Commands::Simulate { controller, time } => {
            let mode = match controller.agent {
                Some(path) => SimulationMode::Agent(path),
                None => SimulationMode::Lqr,
            };
            let report = tokio::task::spawn_blocking(move || runner::simulate(&settings, &mode, time, cancel))
                .await
                .context("Simulation task panicked")??;
            info!(
                "Simulated {:.1} s ({} steps), data written to {:?}",
                report.sim_time, report.rows, report.output
            );
            Ok(())
        }
        cli::Commands::Train {
            timesteps,
            agent,
            note,
            no_reporting,
            num_envs,
        } => {
            let mut config = TrainingConfig::from(&settings.training);
            config.timesteps = timesteps.unwrap_or(config.timesteps);
            config.num_envs = num_envs.or(config.num_envs);
            config.no_reporting |= no_reporting;
            config.agent = agent;
            config.note = note;

            let outcome = tokio::task::spawn_blocking(move || runner::train(&settings, config, cancel))
                .await
                .context("Training task panicked")??;
            info!(
                "Experiment '{}' done, final checkpoint at {:?}",
                outcome.experiment.id, outcome.final_checkpoint
            );
            Ok(())
        }
        cli::Commands::Config => {
            let rendered = toml::to_string_pretty(&settings).context("Failed to render settings")?;
            println!("{rendered}");
            Ok(())
        }
    }
}
