//! Scalar training metrics written as TensorBoard event files.
//!
//! Each run writes `events.out.tfevents.*` into the experiment's `tensorboard`
//! directory, readable by any TensorBoard viewer.

use anyhow::{anyhow, Context, Result};
use std::panic;
use std::path::{Path, PathBuf};
use tensorboard_rs::summary_writer::SummaryWriter;

/// Substring TensorBoard uses to recognise event files.
pub const EVENT_FILE_MARKER: &str = "tfevents";

pub struct ScalarLog {
    dir: PathBuf,
    writer: SummaryWriter,
}

impl ScalarLog {
    /// Start a new event file inside `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create event log directory: {:?}", dir))?;
        // the writer panics on I/O errors instead of returning them
        let writer = panic::catch_unwind(|| SummaryWriter::new(dir))
            .map_err(|_| anyhow!("Failed to open TensorBoard event file in {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            writer,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn add_scalar(&mut self, tag: &str, step: u64, value: f64) {
        self.writer.add_scalar(tag, value as f32, step as usize);
    }

    pub fn flush(&mut self) {
        self.writer.flush();
    }
}

/// Event files present in `dir`, sorted by name.
pub fn event_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        let is_event_file = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.contains(EVENT_FILE_MARKER));
        if is_event_file && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
