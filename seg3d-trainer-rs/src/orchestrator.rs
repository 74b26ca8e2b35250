//! Epoch loop tying data, model, loss, optimizer and checkpoints together.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{self, CheckpointKind, CheckpointStore, TrainingState, FORMAT_VERSION};
use crate::config::FinetuneConfig;
use crate::dataset::{Manifest, ManifestDataset, SyntheticDataset, VolumeDataset};
use crate::device::{DeviceDispatcher, DevicePlan, DispatchedModel};
use crate::error::{Result, TrainError};
use crate::loader::{Batch, DataLoader, LoaderConfig};
use crate::loss::WeightedLoss;
use crate::metrics::{EpochMetrics, EpochRecord, Phase, RunningLoss, TrainingHistory};
use crate::model::{build_model, SegmentationModel};
use crate::optimizer::{Adam, AdamParams};
use crate::scheduler::ReduceLrOnPlateau;
use crate::selector::{ParameterPartition, ParameterSelector};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {prefix} {msg}";

/// Where the orchestrator is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Constructed, not yet fitting.
    Idle,
    /// Inside an epoch.
    Training {
        /// Zero-based epoch index.
        epoch: usize,
        /// Phase being run.
        phase: Phase,
    },
    /// `fit` returned.
    Done,
}

/// Outcome of [`TrainingOrchestrator::fit`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Epochs executed by this call.
    pub epochs_run: usize,
    /// Lowest validation loss over the whole run, including resumed epochs.
    pub best_metric: Option<f64>,
    /// Epoch that produced `best_metric`.
    pub best_epoch: Option<usize>,
    /// Learning rate at the end.
    pub final_learning_rate: f64,
    /// Per-epoch records.
    pub history: TrainingHistory,
}

/// Runs train / validation epochs and keeps the best checkpoint.
pub struct TrainingOrchestrator {
    config: FinetuneConfig,
    model: DispatchedModel,
    partition: ParameterPartition,
    loss: WeightedLoss,
    optimizer: Adam,
    scheduler: ReduceLrOnPlateau,
    train_loader: DataLoader,
    val_loader: DataLoader,
    store: CheckpointStore,
    history: TrainingHistory,
    state: OrchestratorState,
    start_epoch: usize,
    best_metric: Option<f64>,
    best_epoch: Option<usize>,
    interrupt: Arc<AtomicBool>,
}

impl TrainingOrchestrator {
    /// Build every component from a config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or any component fails to
    /// initialise.
    pub fn new(config: FinetuneConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = DeviceDispatcher::from_config(&config.model);
        let plan = dispatcher.detect();
        let model = build_model(&config.model, plan.primary(), config.seed)?;
        let (train, val) = build_datasets(&config)?;
        Self::from_parts(config, model, &plan, train, val)
    }

    /// Assemble an orchestrator around an existing model and datasets.
    ///
    /// The model must live on the plan's primary device.
    ///
    /// # Errors
    ///
    /// Returns an error if no parameter is trainable or a component fails to
    /// initialise.
    pub fn from_parts(
        config: FinetuneConfig,
        model: Box<dyn SegmentationModel>,
        plan: &DevicePlan,
        train: Arc<dyn VolumeDataset>,
        val: Arc<dyn VolumeDataset>,
    ) -> Result<Self> {
        let partition =
            ParameterSelector::from_patterns(config.trainable_layers.iter().cloned())
                .select(model.as_ref())?;
        let optimizer = Adam::new(&partition, AdamParams::from(&config.training))?;
        let model = DeviceDispatcher::from_config(&config.model).wrap(model, plan, &partition)?;
        let loss = WeightedLoss::from_config(&config.loss)?;
        let scheduler = ReduceLrOnPlateau::new(&config.training.plateau);

        let loader_config = |shuffle: bool, seed: u64| LoaderConfig {
            batch_size: config.training.batch_size,
            shuffle,
            workers: config.data.workers,
            prefetch_factor: config.data.prefetch_factor,
            seed,
        };
        let train_loader = DataLoader::new(train, loader_config(true, config.seed))?;
        let val_loader = DataLoader::new(val, loader_config(false, config.seed.wrapping_add(1)))?;
        tracing::info!(
            "Loaded {} training and {} validation samples",
            train_loader.sample_count(),
            val_loader.sample_count()
        );

        let store = CheckpointStore::new(&config.output_dir);
        Ok(Self {
            config,
            model,
            partition,
            loss,
            optimizer,
            scheduler,
            train_loader,
            val_loader,
            store,
            history: TrainingHistory::new(),
            state: OrchestratorState::Idle,
            start_epoch: 0,
            best_metric: None,
            best_epoch: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share an externally owned interrupt flag.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    /// Flag polled between batches; setting it stops the run.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &FinetuneConfig {
        &self.config
    }

    /// Placed model.
    #[must_use]
    pub fn model(&self) -> &DispatchedModel {
        &self.model
    }

    /// Trainable / frozen split.
    #[must_use]
    pub fn partition(&self) -> &ParameterPartition {
        &self.partition
    }

    /// Optimizer state.
    #[must_use]
    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Epoch records so far.
    #[must_use]
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Checkpoint locations.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.store
    }

    /// First epoch `fit` will run.
    #[must_use]
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Restore a checkpoint and continue after its last completed epoch.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is unreadable or does not match the
    /// model.
    pub fn resume_from(&mut self, dir: &Path) -> Result<()> {
        let state = checkpoint::load_checkpoint(dir, self.model.primary(), &mut self.optimizer)?;
        self.model.broadcast_all()?;
        self.scheduler = state.scheduler;
        self.best_metric = state.best_metric;
        self.best_epoch = state.best_epoch;
        self.start_epoch = state.completed_epochs;

        let metrics_path = self.config.output_dir.join("metrics.csv");
        if metrics_path.is_file() {
            let previous = TrainingHistory::read_csv(&metrics_path)?;
            self.history = TrainingHistory::new();
            for record in previous.records() {
                if record.epoch < self.start_epoch {
                    self.history.push(record.clone());
                }
            }
        }
        tracing::info!("Resuming at epoch {}", self.start_epoch + 1);
        Ok(())
    }

    /// Load model weights only, for evaluation.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is unreadable or incomplete.
    pub fn load_weights(&mut self, dir: &Path) -> Result<()> {
        let report = self.model.primary().load_weights(&dir.join("model.safetensors"))?;
        if !report.missing.is_empty() || !report.shape_mismatch.is_empty() {
            return Err(TrainError::Checkpoint(format!(
                "{} does not match the model: missing {:?}, mismatched {:?}",
                dir.display(),
                report.missing,
                report.shape_mismatch
            )));
        }
        self.model.broadcast_all()
    }

    /// Run every remaining epoch.
    ///
    /// On interrupt the current best state is already on disk in `best/`.
    /// `last/` is written as well and holds the weights as they were when the
    /// flag was seen, possibly partway through an epoch, with
    /// `completed_epochs` set to the interrupted epoch. Resuming from `last/`
    /// therefore reruns that epoch from those weights; resuming from `best/`
    /// restarts after the best epoch.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::BatchFailed`] when a batch fails,
    /// [`TrainError::Interrupted`] after an interrupt (having written the
    /// `last/` checkpoint), or an IO error if checkpoints cannot be written.
    pub fn fit(&mut self) -> Result<RunSummary> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        self.config
            .to_file(self.config.output_dir.join("config.yaml"))?;

        let epochs = self.config.training.epochs;
        tracing::info!("Starting training");
        tracing::info!("  Epochs: {}", epochs);
        tracing::info!("  Batch size: {}", self.config.training.batch_size);
        tracing::info!("  Devices: {}", self.model.device_count());
        tracing::info!("  Learning rate: {:.2e}", self.optimizer.learning_rate());

        let mut epochs_run = 0;
        for epoch in self.start_epoch..epochs {
            let result = self.run_epoch(epoch);
            match result {
                Ok(()) => epochs_run += 1,
                Err(err @ TrainError::Interrupted { .. }) => {
                    self.state = OrchestratorState::Done;
                    let path = self.save(CheckpointKind::Last, epoch, epoch)?;
                    tracing::warn!(
                        "Interrupted during epoch {}; mid-epoch state saved to {}",
                        epoch + 1,
                        path.display()
                    );
                    return Err(err);
                }
                Err(err) => {
                    self.state = OrchestratorState::Done;
                    tracing::error!("Training failed: {err}");
                    return Err(err);
                }
            }
        }

        self.state = OrchestratorState::Done;
        if let Some(best) = self.best_metric {
            tracing::info!(
                "Training complete. Best val loss {:.4} at epoch {}",
                best,
                self.best_epoch.map_or(0, |e| e + 1)
            );
        }
        Ok(RunSummary {
            epochs_run,
            best_metric: self.best_metric,
            best_epoch: self.best_epoch,
            final_learning_rate: self.optimizer.learning_rate(),
            history: self.history.clone(),
        })
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<()> {
        let epochs = self.config.training.epochs;
        tracing::info!("Epoch {}/{}", epoch + 1, epochs);

        let train = self.run_phase(epoch, Phase::Train)?;
        let val = self.run_phase(epoch, Phase::Val)?;

        if let Some(lr) = self.scheduler.step(val.mean_loss, &mut self.optimizer) {
            tracing::info!("Learning rate now {lr:.3e}");
        }

        let improved = self.best_metric.map_or(true, |best| val.mean_loss < best);
        if improved {
            self.best_metric = Some(val.mean_loss);
            self.best_epoch = Some(epoch);
            let path = self.save(CheckpointKind::Best, epoch, epoch + 1)?;
            tracing::info!("Saved best checkpoint to {}", path.display());
        }

        self.history.push(EpochRecord {
            epoch,
            train_loss: train.mean_loss,
            train_samples: train.sample_count,
            val_loss: val.mean_loss,
            val_samples: val.sample_count,
            learning_rate: self.optimizer.learning_rate(),
            checkpoint_saved: improved,
        });
        self.history
            .write_csv(self.config.output_dir.join("metrics.csv"))?;

        tracing::info!(
            "Epoch {}/{}: train loss {:.4} ({} samples), val loss {:.4} ({} samples)",
            epoch + 1,
            epochs,
            train.mean_loss,
            train.sample_count,
            val.mean_loss,
            val.sample_count
        );
        Ok(())
    }

    /// Validation loss of the current weights.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::BatchFailed`] when a batch fails.
    pub fn evaluate(&mut self) -> Result<EpochMetrics> {
        let epoch = self.start_epoch;
        let metrics = self.run_phase(epoch, Phase::Val)?;
        self.state = OrchestratorState::Done;
        tracing::info!(
            "Validation loss {:.4} over {} samples",
            metrics.mean_loss,
            metrics.sample_count
        );
        Ok(metrics)
    }

    fn run_phase(&mut self, epoch: usize, phase: Phase) -> Result<EpochMetrics> {
        self.state = OrchestratorState::Training { epoch, phase };
        let batches = match phase {
            Phase::Train => self.train_loader.epoch(epoch),
            Phase::Val => self.val_loader.epoch(epoch),
        };
        let bar = self.progress_bar(batches.len(), epoch, phase)?;

        let mut running = RunningLoss::new();
        for (index, batch) in batches.enumerate() {
            if self.interrupt.load(Ordering::SeqCst) {
                bar.abandon_with_message("interrupted");
                return Err(TrainError::Interrupted { epoch });
            }
            let (loss, samples) = batch
                .and_then(|batch| self.process_batch(phase, &batch))
                .map_err(|err| err.at_batch(epoch, phase, index))?;
            running.update(loss, samples);
            bar.set_message(format!("loss {:.4}", running.mean()));
            bar.inc(1);
        }
        bar.finish_and_clear();

        let metrics = EpochMetrics::from_running(epoch, phase, &running);
        tracing::debug!(
            "{} phase of epoch {}: mean loss {:.4}",
            phase,
            epoch + 1,
            metrics.mean_loss
        );
        Ok(metrics)
    }

    fn process_batch(&mut self, phase: Phase, batch: &Batch) -> Result<(f64, usize)> {
        match phase {
            Phase::Train => {
                let step = self.model.train_step(batch, &self.loss, &self.partition)?;
                self.optimizer.step(&step.grads)?;
                Ok((step.loss, step.samples))
            }
            Phase::Val => Ok((self.model.eval_step(batch, &self.loss)?, batch.len)),
        }
    }

    fn progress_bar(&self, len: usize, epoch: usize, phase: Phase) -> Result<ProgressBar> {
        if !self.config.training.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)?
                .progress_chars("#>-"),
        );
        bar.set_prefix(format!("epoch {} {phase}", epoch + 1));
        Ok(bar)
    }

    fn save(
        &self,
        kind: CheckpointKind,
        epoch: usize,
        completed_epochs: usize,
    ) -> Result<std::path::PathBuf> {
        let state = TrainingState {
            format_version: FORMAT_VERSION,
            epoch,
            completed_epochs,
            best_metric: self.best_metric,
            best_epoch: self.best_epoch,
            learning_rate: self.optimizer.learning_rate(),
            optimizer_step: self.optimizer.step_count(),
            scheduler: self.scheduler.clone(),
        };
        self.store
            .save(kind, self.model.primary(), &self.optimizer, &state, &self.config)
    }
}

/// Train and validation datasets described by the config.
///
/// # Errors
///
/// Returns an error if the manifest cannot be read or split.
pub fn build_datasets(
    config: &FinetuneConfig,
) -> Result<(Arc<dyn VolumeDataset>, Arc<dyn VolumeDataset>)> {
    if config.data.synthetic {
        tracing::info!("Using synthetic data");
        let (train, val) = SyntheticDataset::pair(&config.data.synthetic_data, config.seed)?;
        return Ok((Arc::new(train), Arc::new(val)));
    }
    let manifest = Manifest::from_csv(&config.data.manifest, &config.data)?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let (train, val) = manifest.split(config.data.val_fraction, &mut rng)?;
    tracing::info!(
        "Loading data from {}: {} train / {} val",
        config.data.manifest.display(),
        train.len(),
        val.len()
    );
    Ok((
        Arc::new(ManifestDataset::new(train, config.augmentation.train.clone())),
        Arc::new(ManifestDataset::new(val, config.augmentation.val.clone())),
    ))
}
