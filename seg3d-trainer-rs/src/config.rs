//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voxel_augment_rs::TransformPipeline;

use crate::error::{Result, TrainError};

/// Main configuration for a fine-tuning run.
///
/// # Example
///
/// ```rust
/// use seg3d_trainer_rs::FinetuneConfig;
///
/// # fn main() -> seg3d_trainer_rs::Result<()> {
/// let config = FinetuneConfig::from_preset("default")?;
/// config.validate()?;
/// assert_eq!(config.loss.class_weights, vec![1.0, 5.0, 3.0]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneConfig {
    /// Dataset configuration.
    #[serde(default)]
    pub data: DataConfig,

    /// Network configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// Loss configuration.
    #[serde(default)]
    pub loss: LossConfig,

    /// Optimisation hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Train and validation transform pipelines.
    #[serde(default)]
    pub augmentation: AugmentationConfig,

    /// Parameter-name substrings that stay trainable.
    #[serde(default = "default_trainable_layers")]
    pub trainable_layers: Vec<String>,

    /// Output directory for checkpoints and metrics.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_trainable_layers() -> Vec<String> {
    vec!["decoder".into(), "final_conv".into()]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./outputs")
}

fn default_seed() -> u64 {
    42
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            model: ModelConfig::default(),
            loss: LossConfig::default(),
            training: TrainingConfig::default(),
            augmentation: AugmentationConfig::default(),
            trainable_layers: default_trainable_layers(),
            output_dir: default_output_dir(),
            seed: default_seed(),
        }
    }
}

/// Where samples come from and how they are loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// CSV manifest listing image / mask (and optional weight map) files.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Manifest column holding image paths.
    #[serde(default = "default_image_column")]
    pub image_column: String,

    /// Manifest column holding mask paths.
    #[serde(default = "default_mask_column")]
    pub mask_column: String,

    /// Manifest column holding weight-map paths, if any.
    #[serde(default)]
    pub weight_map_column: Option<String>,

    /// Fraction of the manifest held out for validation.
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f64,

    /// Generate random volumes instead of reading the manifest.
    #[serde(default)]
    pub synthetic: bool,

    /// Synthetic data settings.
    #[serde(default)]
    pub synthetic_data: SyntheticConfig,

    /// Loader worker threads; 0 loads on the training thread.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Batches buffered per worker.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
}

fn default_manifest() -> PathBuf {
    PathBuf::from("patch_data/load_data_training.csv")
}

fn default_image_column() -> String {
    "image".into()
}

fn default_mask_column() -> String {
    "mask".into()
}

fn default_val_fraction() -> f64 {
    0.2
}

fn default_workers() -> usize {
    4
}

fn default_prefetch_factor() -> usize {
    2
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            image_column: default_image_column(),
            mask_column: default_mask_column(),
            weight_map_column: None,
            val_fraction: default_val_fraction(),
            synthetic: false,
            synthetic_data: SyntheticConfig::default(),
            workers: default_workers(),
            prefetch_factor: default_prefetch_factor(),
        }
    }
}

/// Shape and size of generated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Image shape `[C, D, H, W]`.
    #[serde(default = "default_synthetic_shape")]
    pub shape: [usize; 4],

    /// Training samples.
    #[serde(default = "default_train_size")]
    pub train_size: usize,

    /// Validation samples.
    #[serde(default = "default_val_size")]
    pub val_size: usize,

    /// Mask channels.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

fn default_synthetic_shape() -> [usize; 4] {
    [1, 24, 24, 24]
}

fn default_train_size() -> usize {
    20
}

fn default_val_size() -> usize {
    5
}

fn default_num_classes() -> usize {
    3
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            shape: default_synthetic_shape(),
            train_size: default_train_size(),
            val_size: default_val_size(),
            num_classes: default_num_classes(),
        }
    }
}

/// Network shape, pretrained weights and device placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input channels.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Output channels of the pretrained architecture.
    #[serde(default = "default_out_channels")]
    pub out_channels: usize,

    /// Feature width of the hidden blocks.
    #[serde(default = "default_features")]
    pub features: usize,

    /// Decoder dropout probability in train mode.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Safetensors file with pretrained weights.
    #[serde(default)]
    pub pretrained: Option<PathBuf>,

    /// Replace the head with one producing this many channels.
    #[serde(default = "default_head_channels")]
    pub head_channels: Option<usize>,

    /// Upper bound on accelerators used for data parallelism.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,

    /// Skip accelerator detection.
    #[serde(default)]
    pub force_cpu: bool,
}

fn default_in_channels() -> usize {
    1
}

fn default_out_channels() -> usize {
    1
}

fn default_features() -> usize {
    32
}

fn default_dropout() -> f32 {
    0.1
}

#[allow(clippy::unnecessary_wraps)]
fn default_head_channels() -> Option<usize> {
    Some(3)
}

fn default_max_devices() -> usize {
    8
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            out_channels: default_out_channels(),
            features: default_features(),
            dropout: default_dropout(),
            pretrained: None,
            head_channels: default_head_channels(),
            max_devices: default_max_devices(),
            force_cpu: false,
        }
    }
}

impl ModelConfig {
    /// Channels the network produces once the head is in place.
    #[must_use]
    pub fn output_channels(&self) -> usize {
        self.head_channels.unwrap_or(self.out_channels)
    }
}

/// Weighted BCE + Dice settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// One non-negative weight per output channel.
    #[serde(default = "default_class_weights")]
    pub class_weights: Vec<f32>,

    /// Reduce per channel before weighting.
    #[serde(default = "default_per_channel")]
    pub per_channel: bool,
}

fn default_class_weights() -> Vec<f32> {
    vec![1.0, 5.0, 3.0]
}

fn default_per_channel() -> bool {
    true
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            class_weights: default_class_weights(),
            per_channel: default_per_channel(),
        }
    }
}

/// Optimisation hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Adam learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// L2 penalty added to gradients.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Adam moment decay rates.
    #[serde(default = "default_betas")]
    pub betas: (f64, f64),

    /// Adam denominator epsilon.
    #[serde(default = "default_adam_eps")]
    pub eps: f64,

    /// Plateau scheduler settings.
    #[serde(default)]
    pub plateau: PlateauConfig,

    /// Draw progress bars.
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    4
}

fn default_lr() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    1e-5
}

fn default_betas() -> (f64, f64) {
    (0.9, 0.999)
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_true() -> bool {
    true
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            weight_decay: default_weight_decay(),
            betas: default_betas(),
            eps: default_adam_eps(),
            plateau: PlateauConfig::default(),
            show_progress: true,
        }
    }
}

/// Reduce-on-plateau settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauConfig {
    /// Multiplier applied on a plateau.
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Non-improving epochs tolerated before reducing.
    #[serde(default = "default_patience")]
    pub patience: usize,

    /// Relative improvement needed to reset patience.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Epochs to wait after a reduction.
    #[serde(default)]
    pub cooldown: usize,

    /// Learning-rate floor.
    #[serde(default)]
    pub min_lr: f64,
}

fn default_factor() -> f64 {
    0.2
}

fn default_patience() -> usize {
    20
}

fn default_threshold() -> f64 {
    1e-4
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: default_factor(),
            patience: default_patience(),
            threshold: default_threshold(),
            cooldown: 0,
            min_lr: 0.0,
        }
    }
}

/// Transform pipelines per phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Pipeline for training samples.
    #[serde(default = "TransformPipeline::training_default")]
    pub train: TransformPipeline,

    /// Pipeline for validation samples.
    #[serde(default = "TransformPipeline::validation_default")]
    pub val: TransformPipeline,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            train: TransformPipeline::training_default(),
            val: TransformPipeline::validation_default(),
        }
    }
}

impl FinetuneConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"default"` - manifest training with the standard augmentation
    /// - `"smoke-test"` - two epochs on small synthetic volumes, no workers
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "default" => Ok(Self::default()),
            "smoke-test" => Ok(Self::smoke_test_preset()),
            _ => Err(TrainError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Small synthetic run that finishes in seconds on a CPU.
    #[must_use]
    pub fn smoke_test_preset() -> Self {
        Self {
            data: DataConfig {
                synthetic: true,
                synthetic_data: SyntheticConfig {
                    shape: [1, 8, 8, 8],
                    train_size: 6,
                    val_size: 2,
                    num_classes: 3,
                },
                workers: 0,
                ..DataConfig::default()
            },
            model: ModelConfig {
                features: 8,
                dropout: 0.0,
                force_cpu: true,
                ..ModelConfig::default()
            },
            training: TrainingConfig {
                epochs: 2,
                batch_size: 2,
                learning_rate: 1e-3,
                show_progress: false,
                ..TrainingConfig::default()
            },
            output_dir: PathBuf::from("./outputs/smoke-test"),
            ..Self::default()
        }
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let training = &self.training;
        if training.epochs == 0 {
            return Err(TrainError::Config("training.epochs must be > 0".into()));
        }
        if training.batch_size == 0 {
            return Err(TrainError::Config("training.batch_size must be > 0".into()));
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(TrainError::Config(
                "training.learning_rate must be positive".into(),
            ));
        }
        if training.weight_decay < 0.0 {
            return Err(TrainError::Config(
                "training.weight_decay must be >= 0".into(),
            ));
        }
        let (b1, b2) = training.betas;
        if !((0.0..1.0).contains(&b1) && (0.0..1.0).contains(&b2)) {
            return Err(TrainError::Config("training.betas must lie in [0, 1)".into()));
        }
        if !(training.plateau.factor > 0.0 && training.plateau.factor < 1.0) {
            return Err(TrainError::Config(
                "training.plateau.factor must lie in (0, 1)".into(),
            ));
        }

        let model = &self.model;
        if model.in_channels == 0 || model.out_channels == 0 || model.features == 0 {
            return Err(TrainError::Config(
                "model channel counts must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return Err(TrainError::Config("model.dropout must lie in [0, 1)".into()));
        }
        if model.max_devices == 0 {
            return Err(TrainError::Config("model.max_devices must be > 0".into()));
        }

        let outputs = model.output_channels();
        if self.loss.class_weights.len() != outputs {
            return Err(TrainError::Config(format!(
                "loss.class_weights has {} entries but the model produces {outputs} channels",
                self.loss.class_weights.len()
            )));
        }

        if self.trainable_layers.is_empty() {
            return Err(TrainError::Config("trainable_layers is empty".into()));
        }

        let data = &self.data;
        if data.synthetic {
            let synthetic = &data.synthetic_data;
            if synthetic.shape[0] != model.in_channels {
                return Err(TrainError::Config(format!(
                    "synthetic images have {} channels but the model expects {}",
                    synthetic.shape[0], model.in_channels
                )));
            }
            if synthetic.num_classes != outputs {
                return Err(TrainError::Config(format!(
                    "synthetic masks have {} channels but the model produces {outputs}",
                    synthetic.num_classes
                )));
            }
            if synthetic.train_size == 0 || synthetic.val_size == 0 {
                return Err(TrainError::Config(
                    "synthetic dataset sizes must be > 0".into(),
                ));
            }
        } else {
            if !(data.val_fraction > 0.0 && data.val_fraction < 1.0) {
                return Err(TrainError::Config(
                    "data.val_fraction must lie in (0, 1)".into(),
                ));
            }
            for (phase, pipeline) in [
                ("train", &self.augmentation.train),
                ("val", &self.augmentation.val),
            ] {
                let mask_channels = pipeline.output_mask_channels(1);
                if mask_channels != outputs {
                    return Err(TrainError::Config(format!(
                        "{phase} augmentation yields {mask_channels} mask channels \
                         but the model produces {outputs}"
                    )));
                }
            }
        }
        if data.prefetch_factor == 0 {
            return Err(TrainError::Config("data.prefetch_factor must be > 0".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_matches_reference_run() {
        let config = FinetuneConfig::default();
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.training.epochs, 10);
        assert_eq!(config.data.workers, 4);
        assert_eq!(config.training.learning_rate, 1e-4);
        assert_eq!(config.training.weight_decay, 1e-5);
        assert_eq!(config.training.plateau.factor, 0.2);
        assert_eq!(config.training.plateau.patience, 20);
        assert_eq!(config.model.output_channels(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = FinetuneConfig::smoke_test_preset();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: FinetuneConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_presets() {
        assert!(FinetuneConfig::from_preset("default").is_ok());
        assert!(FinetuneConfig::from_preset("smoke-test").unwrap().validate().is_ok());
        assert!(matches!(
            FinetuneConfig::from_preset("invalid"),
            Err(TrainError::Config(_))
        ));
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "seed: 7\ndata:\n  synthetic: true").unwrap();
        let config = FinetuneConfig::from_file(file.path()).unwrap();
        assert_eq!(config.seed, 7);
        assert!(config.data.synthetic);
        assert_eq!(config.trainable_layers, vec!["decoder", "final_conv"]);
        assert_eq!(config.augmentation.train, TransformPipeline::training_default());
    }

    #[test]
    fn test_yaml_pipeline() {
        let yaml = r"
augmentation:
  train:
    - type: flip
      p: 1.0
    - type: edges_and_centroids
    - type: to_tensor
  val:
    - type: edges_and_centroids
    - type: to_tensor
";
        let config: FinetuneConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.augmentation.train.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_file_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let config = FinetuneConfig::default();
        config.to_file(file.path()).unwrap();
        assert_eq!(FinetuneConfig::from_file(file.path()).unwrap(), config);
    }

    #[test]
    fn test_class_weight_count_must_match_head() {
        let mut config = FinetuneConfig::default();
        config.loss.class_weights = vec![1.0, 1.0];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("class_weights"));
    }

    #[test]
    fn test_pipeline_channels_must_match_head() {
        let mut config = FinetuneConfig::default();
        config.augmentation.val = TransformPipeline::identity();
        assert!(config.validate().is_err());

        // synthetic data bypasses augmentation
        config.data.synthetic = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_hyperparameters() {
        let mut config = FinetuneConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = FinetuneConfig::default();
        config.training.learning_rate = -1.0;
        assert!(config.validate().is_err());

        let mut config = FinetuneConfig::default();
        config.data.val_fraction = 1.0;
        assert!(config.validate().is_err());

        let mut config = FinetuneConfig::default();
        config.trainable_layers.clear();
        assert!(config.validate().is_err());
    }
}
