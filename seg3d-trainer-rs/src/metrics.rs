//! Per-phase loss accounting and the run history.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Train or validation portion of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Parameter updates enabled.
    Train,
    /// Evaluation only.
    Val,
}

impl Phase {
    /// Both phases in execution order.
    pub const ALL: [Phase; 2] = [Phase::Train, Phase::Val];

    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size-weighted running mean of batch losses.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningLoss {
    sum: f64,
    count: usize,
}

impl RunningLoss {
    /// Fresh accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the mean loss of a batch of `batch_size` samples.
    pub fn update(&mut self, batch_loss: f64, batch_size: usize) {
        #[allow(clippy::cast_precision_loss)]
        let weight = batch_size as f64;
        self.sum += batch_loss * weight;
        self.count += batch_size;
    }

    /// Mean loss so far; zero before any update.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let n = self.count as f64;
            self.sum / n
        }
    }

    /// Samples seen so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Loss summary of one phase of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Phase the metrics belong to.
    pub phase: Phase,
    /// Size-weighted mean batch loss.
    pub mean_loss: f64,
    /// Samples processed in the phase.
    pub sample_count: usize,
}

impl EpochMetrics {
    /// Freeze a running accumulator into a record.
    #[must_use]
    pub fn from_running(epoch: usize, phase: Phase, running: &RunningLoss) -> Self {
        Self {
            epoch,
            phase,
            mean_loss: running.mean(),
            sample_count: running.count(),
        }
    }
}

/// One row of `metrics.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Mean training loss.
    pub train_loss: f64,
    /// Training samples seen.
    pub train_samples: usize,
    /// Mean validation loss.
    pub val_loss: f64,
    /// Validation samples seen.
    pub val_samples: usize,
    /// Learning rate after the scheduler step.
    pub learning_rate: f64,
    /// Whether this epoch wrote the best checkpoint.
    pub checkpoint_saved: bool,
}

/// All epoch records of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    records: Vec<EpochRecord>,
}

impl TrainingHistory {
    /// Empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the outcome of a finished epoch.
    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    /// Records in epoch order.
    #[must_use]
    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    /// Most recent record.
    #[must_use]
    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    /// Write every record to `path` as CSV with a header row.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a history written by [`TrainingHistory::write_csv`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let records = reader
            .deserialize()
            .collect::<std::result::Result<Vec<EpochRecord>, _>>()?;
        Ok(Self { records })
    }
}
