//! Experiment lifecycle: identity, artifact directory layout and manifest.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Sub-directory holding periodic and final checkpoints.
pub const AGENTS_DIR: &str = "agents";
/// Sub-directory holding structured training reports.
pub const REPORT_DIR: &str = "training_report";
/// Sub-directory holding the scalar event-log stream.
pub const TENSORBOARD_DIR: &str = "tensorboard";
/// Manifest file at the experiment root.
pub const MANIFEST_FILE: &str = "Note.txt";

/// How many same-second disambiguators to try before giving up.
const MAX_ID_ATTEMPTS: usize = 1_000;

/// One training run and its artifact tree. Created once, never moved.
#[derive(Debug, Clone, Serialize)]
pub struct Experiment {
    pub id: String,
    pub root: PathBuf,
    pub agents_dir: PathBuf,
    pub report_dir: PathBuf,
    pub tensorboard_dir: PathBuf,
}

impl Experiment {
    /// Allocate `<logs_root>/<unix seconds><suffix>` and its sub-directories.
    ///
    /// Runs started within the same second get `_1`, `_2`, ... appended
    /// instead of sharing a directory.
    #[instrument]
    pub fn create(logs_root: &Path, suffix: &str) -> Result<Self> {
        fs::create_dir_all(logs_root)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_root))?;

        let base_id = format!("{}{}", Utc::now().timestamp(), suffix);
        let (id, root) = Self::claim_root(logs_root, &base_id)?;

        let experiment = Self {
            agents_dir: root.join(AGENTS_DIR),
            report_dir: root.join(REPORT_DIR),
            tensorboard_dir: root.join(TENSORBOARD_DIR),
            id,
            root,
        };
        for dir in [&experiment.agents_dir, &experiment.report_dir, &experiment.tensorboard_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create experiment directory: {:?}", dir))?;
        }

        info!("Created experiment '{}' at {:?}", experiment.id, experiment.root);
        Ok(experiment)
    }

    fn claim_root(logs_root: &Path, base_id: &str) -> Result<(String, PathBuf)> {
        for attempt in 0..MAX_ID_ATTEMPTS {
            let id = if attempt == 0 {
                base_id.to_string()
            } else {
                format!("{base_id}_{attempt}")
            };
            let root = logs_root.join(&id);
            match fs::create_dir(&root) {
                Ok(()) => return Ok((id, root)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!("Experiment id '{}' already taken, trying the next one", id);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create experiment root: {:?}", root));
                }
            }
        }
        anyhow::bail!("No free experiment id for '{}' after {} attempts", base_id, MAX_ID_ATTEMPTS)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Append the environment configuration and an optional note to the manifest.
    /// Best-effort: failures are logged and the experiment carries on.
    pub fn append_manifest(&self, env_config: &serde_json::Value, note: Option<&str>) {
        if let Err(e) = self.try_append_manifest(env_config, note) {
            warn!("Could not write experiment manifest {:?}: {:#}", self.manifest_path(), e);
        }
    }

    fn try_append_manifest(&self, env_config: &serde_json::Value, note: Option<&str>) -> Result<()> {
        let path = self.manifest_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open manifest: {:?}", path))?;
        writeln!(file, "env_config: {}", serde_json::to_string(env_config)?)?;
        if let Some(note) = note {
            writeln!(file, "{}", note)?;
        }
        Ok(())
    }

    /// Path of the final checkpoint for a run of `steps` steps.
    pub fn final_checkpoint_path(&self, steps: u64) -> PathBuf {
        self.agents_dir.join(format!("last_model_{steps}.json"))
    }
}
