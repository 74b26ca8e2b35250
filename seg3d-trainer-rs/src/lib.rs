//! # seg3d-trainer-rs
//!
//! YAML-driven fine-tuning of 3D segmentation networks.
//!
//! A run loads a pretrained volumetric network, freezes everything except a
//! chosen set of layers, replaces the output head for the target number of
//! classes, and trains on augmented image / mask volumes with a
//! class-weighted BCE + Dice loss. The best validation checkpoint is kept.
//!
//! ## Features
//!
//! - **YAML Configuration** - Data, model, loss, optimiser and augmentation in one file
//! - **Layer selection** - Substring patterns decide which parameters train
//! - **Multi-device** - Data-parallel batches across every visible accelerator
//! - **Resumable** - Best and interrupt checkpoints carry optimiser and scheduler state
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Check a configuration
//! seg3d-train validate config.yaml
//!
//! # Train on synthetic volumes
//! seg3d-train train --dummy --epochs 2
//!
//! # Train from a manifest
//! seg3d-train train patch_data/load_data_training.csv --batch 4 --workers 4
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use seg3d_trainer_rs::{FinetuneConfig, TrainingOrchestrator};
//!
//! # fn main() -> seg3d_trainer_rs::Result<()> {
//! let config = FinetuneConfig::from_file("config.yaml")?;
//! let mut orchestrator = TrainingOrchestrator::new(config)?;
//! let summary = orchestrator.fit()?;
//! println!("best val loss: {:?}", summary.best_metric);
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use seg3d_trainer_rs::FinetuneConfig;
//!
//! # fn main() -> seg3d_trainer_rs::Result<()> {
//! let mut config = FinetuneConfig::from_preset("smoke-test")?;
//! config.training.epochs = 5;
//! config.loss.class_weights = vec![1.0, 5.0, 3.0];
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod loader;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod orchestrator;
pub mod scheduler;
pub mod selector;

pub use checkpoint::{CheckpointKind, CheckpointStore, TrainingState};
pub use config::{
    AugmentationConfig, DataConfig, FinetuneConfig, LossConfig, ModelConfig, TrainingConfig,
};
pub use dataset::{Manifest, ManifestDataset, SyntheticDataset, VolumeDataset};
pub use device::{DataParallel, DeviceDispatcher, DevicePlan, DispatchedModel};
pub use error::{Result, TrainError};
pub use loader::{Batch, DataLoader, LoaderConfig};
pub use loss::WeightedLoss;
pub use metrics::{EpochMetrics, EpochRecord, Phase, TrainingHistory};
pub use model::{build_model, GradientFlow, Mode, SegmentationModel, UNet3dLite};
pub use optimizer::{Adam, AdamParams, GradientSet};
pub use orchestrator::{OrchestratorState, RunSummary, TrainingOrchestrator};
pub use scheduler::ReduceLrOnPlateau;
pub use selector::{ParameterGroup, ParameterPartition, ParameterSelector};
