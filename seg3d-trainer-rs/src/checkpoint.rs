//! Checkpoint directories for the best and most recent training state.
//!
//! A checkpoint is a directory holding `model.safetensors`,
//! `optimizer.safetensors`, `training_state.json` and a copy of the run's
//! `config.yaml`. Each write goes to a temporary sibling that is renamed into
//! place, so an existing checkpoint is only replaced by a complete one.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::FinetuneConfig;
use crate::error::{Result, TrainError};
use crate::model::SegmentationModel;
use crate::optimizer::Adam;
use crate::scheduler::ReduceLrOnPlateau;

/// Current `training_state.json` layout.
pub const FORMAT_VERSION: u32 = 1;

const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const STATE_FILE: &str = "training_state.json";
const CONFIG_FILE: &str = "config.yaml";

/// Scalar training progress stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Layout version.
    pub format_version: u32,
    /// Epoch during which the checkpoint was written.
    pub epoch: usize,
    /// Epochs fully finished; a resumed run starts at this index.
    pub completed_epochs: usize,
    /// Lowest validation loss so far; `None` before the first validation.
    pub best_metric: Option<f64>,
    /// Epoch that produced `best_metric`.
    pub best_epoch: Option<usize>,
    /// Learning rate after the epoch's scheduler step.
    pub learning_rate: f64,
    /// Optimizer steps taken.
    pub optimizer_step: usize,
    /// Plateau scheduler bookkeeping.
    pub scheduler: ReduceLrOnPlateau,
}

/// Which checkpoint slot to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Lowest validation loss.
    Best,
    /// Most recent state, written on interrupt.
    Last,
}

impl CheckpointKind {
    fn dir_name(self) -> &'static str {
        match self {
            CheckpointKind::Best => "best",
            CheckpointKind::Last => "last",
        }
    }
}

/// Manages the `best/` and `last/` checkpoints under a root directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Store rooted at `root`; nothing is created until the first save.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a checkpoint slot.
    #[must_use]
    pub fn path(&self, kind: CheckpointKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Whether a complete checkpoint exists in the slot.
    #[must_use]
    pub fn exists(&self, kind: CheckpointKind) -> bool {
        self.path(kind).join(STATE_FILE).is_file()
    }

    /// Write a checkpoint into a slot.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written; the previous
    /// checkpoint in the slot is then left untouched.
    pub fn save(
        &self,
        kind: CheckpointKind,
        model: &dyn SegmentationModel,
        optimizer: &Adam,
        state: &TrainingState,
        config: &FinetuneConfig,
    ) -> Result<PathBuf> {
        let target = self.path(kind);
        save_checkpoint(&target, model, optimizer, state, config)?;
        tracing::debug!("Wrote {} checkpoint to {}", kind.dir_name(), target.display());
        Ok(target)
    }
}

/// Write a checkpoint directory at `target`.
///
/// # Errors
///
/// Returns an error if any file cannot be written or renamed.
pub fn save_checkpoint(
    target: &Path,
    model: &dyn SegmentationModel,
    optimizer: &Adam,
    state: &TrainingState,
    config: &FinetuneConfig,
) -> Result<()> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TrainError::Checkpoint(format!("invalid path {}", target.display())))?;
    let tmp = target.with_file_name(format!(".{name}.tmp"));
    let old = target.with_file_name(format!(".{name}.old"));

    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;

    let written = write_contents(&tmp, model, optimizer, state, config);
    if let Err(err) = written {
        let _ = fs::remove_dir_all(&tmp);
        return Err(err);
    }

    if old.exists() {
        fs::remove_dir_all(&old)?;
    }
    if target.exists() {
        fs::rename(target, &old)?;
    }
    fs::rename(&tmp, target)?;
    if old.exists() {
        fs::remove_dir_all(&old)?;
    }
    Ok(())
}

fn write_contents(
    dir: &Path,
    model: &dyn SegmentationModel,
    optimizer: &Adam,
    state: &TrainingState,
    config: &FinetuneConfig,
) -> Result<()> {
    model.save(&dir.join(MODEL_FILE))?;
    candle_core::safetensors::save(&optimizer.state_tensors(), dir.join(OPTIMIZER_FILE))?;
    fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;
    config.to_file(dir.join(CONFIG_FILE))?;
    Ok(())
}

/// Read only the scalar state of a checkpoint.
///
/// # Errors
///
/// Returns an error if the file is missing, malformed or of a newer format.
pub fn read_state(dir: &Path) -> Result<TrainingState> {
    let path = dir.join(STATE_FILE);
    let text = fs::read_to_string(&path).map_err(|e| {
        TrainError::Checkpoint(format!("cannot read {}: {e}", path.display()))
    })?;
    let state: TrainingState = serde_json::from_str(&text)?;
    if state.format_version > FORMAT_VERSION {
        return Err(TrainError::Checkpoint(format!(
            "checkpoint format {} is newer than supported {FORMAT_VERSION}",
            state.format_version
        )));
    }
    Ok(state)
}

/// Restore model weights and optimizer state from a checkpoint.
///
/// Every model parameter must be present with the saved shape.
///
/// # Errors
///
/// Returns [`TrainError::Checkpoint`] when the checkpoint does not match the
/// model, or an IO / tensor error if files cannot be read.
pub fn load_checkpoint(
    dir: &Path,
    model: &dyn SegmentationModel,
    optimizer: &mut Adam,
) -> Result<TrainingState> {
    let state = read_state(dir)?;
    let report = model.load_weights(&dir.join(MODEL_FILE))?;
    if !report.missing.is_empty() || !report.shape_mismatch.is_empty() {
        return Err(TrainError::Checkpoint(format!(
            "checkpoint {} does not match the model: missing {:?}, mismatched {:?}",
            dir.display(),
            report.missing,
            report.shape_mismatch
        )));
    }
    let moments = candle_core::safetensors::load(dir.join(OPTIMIZER_FILE), model.device())?;
    optimizer.load_state(&moments, state.optimizer_step)?;
    optimizer.set_learning_rate(state.learning_rate);
    tracing::info!(
        "Restored checkpoint {} (epoch {}, best {:?})",
        dir.display(),
        state.epoch,
        state.best_metric
    );
    Ok(state)
}

/// Load the config saved alongside a checkpoint.
///
/// # Errors
///
/// Returns an error if the file is missing or malformed.
pub fn read_config(dir: &Path) -> Result<FinetuneConfig> {
    FinetuneConfig::from_file(dir.join(CONFIG_FILE))
}
