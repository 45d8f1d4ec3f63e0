//! Trajectory recording, tabulation and collision-free persistence.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::state::{column_labels, Action, StateVector, StepOutcome, TABLE_WIDTH};

/// One simulated step.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryRecord {
    pub time: f64,
    pub state: StateVector,
    pub state_dot: StateVector,
    pub action: Action,
    pub reward: f64,
}

impl TrajectoryRecord {
    pub fn from_outcome(outcome: &StepOutcome) -> Self {
        Self {
            time: outcome.info.time,
            state: outcome.info.state,
            state_dot: outcome.info.state_dot,
            action: outcome.info.action,
            reward: outcome.reward,
        }
    }

    fn to_row(&self) -> Vec<f64> {
        let mut row = Vec::with_capacity(TABLE_WIDTH);
        row.push(self.time);
        row.extend_from_slice(&self.state);
        row.extend_from_slice(&self.state_dot);
        row.extend_from_slice(&self.action);
        row.push(self.reward);
        row
    }
}

/// Append-only record buffer for one episode.
#[derive(Debug, Default)]
pub struct TrajectoryRecorder {
    records: Vec<TrajectoryRecord>,
}

impl TrajectoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn push(&mut self, record: TrajectoryRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TrajectoryRecord] {
        &self.records
    }

    /// Assemble the labeled table, leaving the recorder empty.
    pub fn finish(&mut self) -> TrajectoryTable {
        let rows = self.records.drain(..).map(|r| r.to_row()).collect();
        TrajectoryTable {
            columns: column_labels(),
            rows,
        }
    }
}

/// Finalized episode data; column order is fixed by [`column_labels`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryTable {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl TrajectoryTable {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All values of the named column.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[index]).collect())
    }

    /// CSV with a leading row-index column and a header line, header-only when empty.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut out = BufWriter::new(writer);
        writeln!(out, ",{}", self.columns.join(","))?;
        for (index, row) in self.rows.iter().enumerate() {
            write!(out, "{}", index)?;
            for value in row {
                write!(out, ",{}", value)?;
            }
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("Failed to open trajectory file: {:?}", path))?;
        let mut lines = BufReader::new(file).lines();

        let header = lines
            .next()
            .ok_or_else(|| anyhow!("Trajectory file {:?} has no header", path))??;
        let columns: Vec<String> = header.split(',').skip(1).map(str::to_string).collect();
        if columns != column_labels() {
            bail!("Trajectory file {:?} has unexpected columns", path);
        }

        let mut rows = Vec::new();
        for (line_no, line) in lines.enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let row = line
                .split(',')
                .skip(1)
                .map(|v| v.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Bad value on data line {} of {:?}", line_no + 1, path))?;
            if row.len() != columns.len() {
                bail!("Data line {} of {:?} has {} values", line_no + 1, path, row.len());
            }
            rows.push(row);
        }
        Ok(Self { columns, rows })
    }
}

/// Write `table` to `dir/{prefix}_{i}.csv` for the first unused `i`, never overwriting.
pub fn save_table(table: &TrajectoryTable, dir: &Path, prefix: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create simulation directory: {:?}", dir))?;

    let mut suffix = 0usize;
    loop {
        let path = dir.join(format!("{prefix}_{suffix}.csv"));
        if path.exists() {
            suffix += 1;
            continue;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                table
                    .write_csv(file)
                    .with_context(|| format!("Failed to write trajectory: {:?}", path))?;
                info!("Saved {} simulated steps to {:?}", table.len(), path);
                return Ok(path);
            }
            // lost a race against another writer; try the next suffix
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("Trajectory path {:?} taken concurrently", path);
                suffix += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create trajectory file: {:?}", path));
            }
        }
    }
}

/// Where a simulation run stores its table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLocation {
    pub dir: PathBuf,
    pub prefix: String,
}

impl OutputLocation {
    /// Fixed-gain runs share one directory under the logs root.
    pub fn for_lqr(logs_root: &Path) -> Self {
        Self {
            dir: logs_root.join("LQR_simulations"),
            prefix: "_simdata_lqr".to_string(),
        }
    }

    /// Agent runs go next to the experiment that produced the checkpoint:
    /// `<logs>/<experiment>/agents/<name>.json` gives `<logs>/<experiment>/sim_data`.
    pub fn for_agent(logs_root: &Path, checkpoint: &Path) -> Result<Self> {
        let components: Vec<_> = checkpoint.components().collect();
        if components.len() < 3 {
            bail!(
                "Checkpoint path {:?} is not inside an experiment directory (<experiment>/agents/<file>)",
                checkpoint
            );
        }
        let experiment = components[components.len() - 3].as_os_str();
        let stem = checkpoint
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("Checkpoint path {:?} has no file name", checkpoint))?;

        Ok(Self {
            dir: logs_root.join(experiment).join("sim_data"),
            prefix: format!("_simdata_{stem}"),
        })
    }
}
