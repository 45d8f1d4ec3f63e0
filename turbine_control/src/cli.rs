//! Command-line interface definitions using clap derive API.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Turbine stabilisation simulation and training CLI
#[derive(Parser)]
#[command(name = "turbine-cli")]
#[command(about = "Simulate and train feedback controllers for a floating turbine")]
#[command(version)]
pub struct Cli {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one closed-loop episode and save its trajectory as CSV
    Simulate {
        #[command(flatten)]
        controller: ControllerChoice,

        /// Maximum simulated time in seconds
        #[arg(long)]
        time: Option<f64>,
    },
    /// Train an agent against a pool of environment replicas
    Train {
        /// Total pool steps to train for
        #[arg(long)]
        timesteps: Option<u64>,

        /// Continue training from this checkpoint
        #[arg(long)]
        agent: Option<PathBuf>,

        /// Free text stored in the experiment manifest
        #[arg(long)]
        note: Option<String>,

        /// Skip the per-episode training report
        #[arg(long)]
        no_reporting: bool,

        /// Number of environment replicas
        #[arg(long)]
        num_envs: Option<usize>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct ControllerChoice {
    /// Drive the episode with a trained agent checkpoint
    #[arg(long)]
    pub agent: Option<PathBuf>,

    /// Drive the episode with the fixed-gain LQR controller
    #[arg(long)]
    pub lqr: bool,
}
