//! Error types for seg3d-trainer-rs.
//!
//! Configuration problems are reported before training starts. Anything that
//! goes wrong inside the batch loop is wrapped in
//! [`TrainError::BatchFailed`] so the diagnostic names the epoch, phase and
//! batch where the run ended.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use seg3d_trainer_rs::{FinetuneConfig, TrainError};
//!
//! # fn main() {
//! match FinetuneConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(TrainError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;
use voxel_augment_rs::AugmentError;

use crate::metrics::Phase;

/// Result type alias for seg3d-trainer-rs operations.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Errors that can occur while configuring or running a fine-tuning job.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrainError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Augmentation failed or was misconfigured.
    #[error("augmentation error: {0}")]
    Augment(#[from] AugmentError),

    /// The trainable-layer patterns matched no parameter.
    #[error("no trainable parameters: patterns {patterns:?} matched none of {total} parameters")]
    NoTrainableParameters {
        /// Patterns that were applied.
        patterns: Vec<String>,
        /// Number of parameters in the model.
        total: usize,
    },

    /// A loss evaluated to NaN or infinity.
    #[error("non-finite loss: {value}")]
    NonFiniteLoss {
        /// The offending loss value.
        value: f32,
    },

    /// An accelerator could not be initialised.
    #[error("device {ordinal} unavailable: {reason}")]
    DeviceUnavailable {
        /// Accelerator ordinal that was probed.
        ordinal: usize,
        /// Reason reported by the backend.
        reason: String,
    },

    /// A batch failed; wraps the underlying cause.
    #[error("epoch {epoch}, {phase} phase, batch {batch}: {source}")]
    BatchFailed {
        /// Zero-based epoch index.
        epoch: usize,
        /// Phase the batch belonged to.
        phase: Phase,
        /// Zero-based batch index within the phase.
        batch: usize,
        /// Underlying error.
        #[source]
        source: Box<TrainError>,
    },

    /// Training stopped by an external interrupt.
    #[error("training interrupted during epoch {epoch}")]
    Interrupted {
        /// Epoch that was running.
        epoch: usize,
    },

    /// Model definition or weight loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset or manifest error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON (de)serialisation error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for TrainError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        TrainError::Template(err.to_string())
    }
}

impl TrainError {
    /// Attach batch coordinates to an error raised inside the batch loop.
    #[must_use]
    pub fn at_batch(self, epoch: usize, phase: Phase, batch: usize) -> Self {
        TrainError::BatchFailed {
            epoch,
            phase,
            batch,
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through [`TrainError::BatchFailed`].
    #[must_use]
    pub fn root_cause(&self) -> &TrainError {
        match self {
            TrainError::BatchFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = TrainError::Config("invalid parameter".to_string());
        assert_eq!(error.to_string(), "configuration error: invalid parameter");
    }

    #[test]
    fn test_batch_failed_names_location() {
        let error = TrainError::NonFiniteLoss { value: f32::NAN }.at_batch(3, Phase::Train, 7);
        let text = error.to_string();
        assert!(text.contains("epoch 3"));
        assert!(text.contains("train phase"));
        assert!(text.contains("batch 7"));
        assert!(text.contains("non-finite loss"));
        assert!(matches!(
            error.root_cause(),
            TrainError::NonFiniteLoss { .. }
        ));
    }

    #[test]
    fn test_augment_error_conversion() {
        let augment = AugmentError::invalid_config("bad transform");
        let error: TrainError = augment.into();
        assert!(error.to_string().starts_with("augmentation error"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: TrainError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error =
            serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: TrainError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let error: TrainError = a.broadcast_add(&b).unwrap_err().into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_no_trainable_parameters_display() {
        let error = TrainError::NoTrainableParameters {
            patterns: vec!["decoder".into()],
            total: 12,
        };
        assert!(error.to_string().contains("\"decoder\""));
        assert!(error.to_string().contains("12"));
    }

    #[test]
    fn test_template_error_conversion() {
        use indicatif::ProgressStyle;

        if let Err(template_error) = ProgressStyle::default_bar().template("{wide_bar:.}") {
            let error: TrainError = template_error.into();
            assert!(error.to_string().contains("template error"));
        }
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let io_error = io::Error::new(io::ErrorKind::NotFound, "weights.npy");
        let error = TrainError::from(io_error).at_batch(0, Phase::Val, 1);
        assert!(error.source().is_some());
    }
}
