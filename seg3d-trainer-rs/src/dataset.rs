//! Volume datasets: CSV manifests of array files and generated data.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use voxel_augment_rs::{Sample, TransformPipeline, Volume};

use crate::config::{DataConfig, SyntheticConfig};
use crate::error::{Result, TrainError};

/// One row of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Image array file.
    pub image: PathBuf,
    /// Mask array file.
    pub mask: PathBuf,
    /// Optional weight-map array file.
    pub weight_map: Option<PathBuf>,
}

/// Ordered list of sample files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Wrap explicit entries.
    #[must_use]
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Read a CSV manifest using the column names from `columns`.
    ///
    /// Relative paths are resolved against the manifest's directory.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Dataset`] if a required column is missing or a
    /// row has an empty path, and a CSV error if the file is malformed.
    pub fn from_csv<P: AsRef<Path>>(path: P, columns: &DataConfig) -> Result<Self> {
        let path = path.as_ref();
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let column = |name: &str| -> Result<usize> {
            headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
                TrainError::Dataset(format!(
                    "{} has no '{name}' column (found {:?})",
                    path.display(),
                    headers.iter().collect::<Vec<_>>()
                ))
            })
        };
        let image_col = column(&columns.image_column)?;
        let mask_col = column(&columns.mask_column)?;
        let weight_col = columns
            .weight_map_column
            .as_deref()
            .map(column)
            .transpose()?;

        let resolve = |field: &str| -> PathBuf {
            let p = PathBuf::from(field.trim());
            if p.is_absolute() {
                p
            } else {
                base.join(p)
            }
        };

        let mut entries = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let field = |col: usize| record.get(col).map(str::trim).unwrap_or_default();
            let (image, mask) = (field(image_col), field(mask_col));
            if image.is_empty() || mask.is_empty() {
                return Err(TrainError::Dataset(format!(
                    "{} row {}: empty image or mask path",
                    path.display(),
                    row + 1
                )));
            }
            let weight_map = weight_col
                .map(field)
                .filter(|w| !w.is_empty())
                .map(resolve);
            entries.push(ManifestEntry {
                image: resolve(image),
                mask: resolve(mask),
                weight_map,
            });
        }
        tracing::debug!("Read {} manifest rows from {}", entries.len(), path.display());
        Ok(Self { entries })
    }

    /// Shuffle, then hold out `ceil(len * val_fraction)` entries for validation.
    ///
    /// Returns `(train, val)`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Dataset`] if either side would be empty.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn split<R: Rng + ?Sized>(&self, val_fraction: f64, rng: &mut R) -> Result<(Self, Self)> {
        let n = self.entries.len();
        let n_val = (n as f64 * val_fraction).ceil() as usize;
        if n_val == 0 || n_val >= n {
            return Err(TrainError::Dataset(format!(
                "cannot split {n} entries with validation fraction {val_fraction}"
            )));
        }
        let mut shuffled = self.entries.clone();
        shuffled.shuffle(rng);
        let train = shuffled.split_off(n_val);
        Ok((Self { entries: train }, Self { entries: shuffled }))
    }

    /// Entries in order.
    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a `.npy` or `.safetensors` array as a channel-first volume.
///
/// 3D arrays gain a leading channel axis. Safetensors files contribute the
/// tensor named `data` if present, otherwise the first by name.
///
/// # Errors
///
/// Returns [`TrainError::Dataset`] for unsupported extensions or ranks.
pub fn read_volume(path: &Path) -> Result<Volume> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let tensor = match ext.as_deref() {
        Some("npy") => Tensor::read_npy(path)?,
        Some("safetensors") => {
            let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
            let key = if tensors.contains_key("data") {
                Some("data".to_string())
            } else {
                let mut keys: Vec<&String> = tensors.keys().collect();
                keys.sort();
                keys.first().map(|k| (*k).clone())
            };
            key.and_then(|k| tensors.get(&k).cloned()).ok_or_else(|| {
                TrainError::Dataset(format!("{} holds no tensors", path.display()))
            })?
        }
        _ => {
            return Err(TrainError::Dataset(format!(
                "unsupported array file {}; expected .npy or .safetensors",
                path.display()
            )))
        }
    };
    tensor_to_volume(&tensor, path)
}

fn tensor_to_volume(tensor: &Tensor, path: &Path) -> Result<Volume> {
    let shape = match *tensor.dims() {
        [d, h, w] => [1, d, h, w],
        [c, d, h, w] => [c, d, h, w],
        ref other => {
            return Err(TrainError::Dataset(format!(
                "{}: expected a 3D or 4D array, got shape {other:?}",
                path.display()
            )))
        }
    };
    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(Volume::new(shape, data)?)
}

/// Random-access source of samples.
///
/// `load` receives the RNG stream that augmentation must draw from; datasets
/// without augmentation ignore it.
pub trait VolumeDataset: Send + Sync {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Whether the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load (and augment) sample `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be read or transformed.
    fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<Sample>;
}

/// Samples read from manifest files and passed through a pipeline.
#[derive(Debug, Clone)]
pub struct ManifestDataset {
    manifest: Manifest,
    pipeline: TransformPipeline,
}

impl ManifestDataset {
    /// Dataset over `manifest` augmented by `pipeline`.
    #[must_use]
    pub fn new(manifest: Manifest, pipeline: TransformPipeline) -> Self {
        Self { manifest, pipeline }
    }

    /// Underlying manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

impl VolumeDataset for ManifestDataset {
    fn len(&self) -> usize {
        self.manifest.len()
    }

    fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<Sample> {
        let entry = self.manifest.entries.get(index).ok_or_else(|| {
            TrainError::Dataset(format!("index {index} out of range for {} samples", self.len()))
        })?;
        let image = read_volume(&entry.image)?;
        let mask = read_volume(&entry.mask)?;
        let weight_map = entry.weight_map.as_deref().map(read_volume).transpose()?;
        let sample = Sample::new(image, mask, weight_map)?;
        Ok(self.pipeline.apply(sample, rng)?)
    }
}

/// Deterministic random image / mask pairs.
///
/// Images are uniform in `[0, 1)`, masks are independent {0, 1} draws per
/// class channel. The same `(seed, index)` always yields the same sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticDataset {
    shape: [usize; 4],
    size: usize,
    num_classes: usize,
    seed: u64,
}

impl SyntheticDataset {
    /// Dataset of `size` samples with image shape `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Dataset`] for a zero-sized shape or class count.
    pub fn new(shape: [usize; 4], size: usize, num_classes: usize, seed: u64) -> Result<Self> {
        if shape.contains(&0) || num_classes == 0 {
            return Err(TrainError::Dataset(format!(
                "synthetic data needs non-zero dims, got shape {shape:?} with {num_classes} classes"
            )));
        }
        Ok(Self {
            shape,
            size,
            num_classes,
            seed,
        })
    }

    /// Train and validation datasets from config, with distinct seeds.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Dataset`] for invalid dimensions.
    pub fn pair(config: &SyntheticConfig, seed: u64) -> Result<(Self, Self)> {
        Ok((
            Self::new(config.shape, config.train_size, config.num_classes, seed)?,
            Self::new(
                config.shape,
                config.val_size,
                config.num_classes,
                seed.wrapping_add(1),
            )?,
        ))
    }
}

impl VolumeDataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.size
    }

    fn load(&self, index: usize, _rng: &mut ChaCha8Rng) -> Result<Sample> {
        if index >= self.size {
            return Err(TrainError::Dataset(format!(
                "index {index} out of range for {} samples",
                self.size
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(index as u64);
        let [c, d, h, w] = self.shape;
        let image: Vec<f32> = (0..c * d * h * w).map(|_| rng.gen::<f32>()).collect();
        let mask: Vec<f32> = (0..self.num_classes * d * h * w)
            .map(|_| if rng.gen::<bool>() { 1.0 } else { 0.0 })
            .collect();
        Ok(Sample::new(
            Volume::new(self.shape, image)?,
            Volume::new([self.num_classes, d, h, w], mask)?,
            None,
        )?)
    }
}
