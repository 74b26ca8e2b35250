//! Ordered composition of transforms.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{AugmentError, Result};
use crate::sample::Sample;
use crate::transform::{
    EdgeMode, EdgesAndCentroids, ElasticDeform, Flip, Normalize, RandomContrastBrightness,
    RandomGaussianBlur, RandomGaussianNoise, RandomPoissonNoise, RandomRot90, Transform,
    TransformKind,
};

/// A validated, ordered list of [`Transform`]s.
///
/// Ordering rules checked at construction:
/// - `to_tensor` may only appear as the last transform;
/// - no geometric or elastic transform may follow `edges_and_centroids`,
///   `normalize` or `to_tensor`.
///
/// # Example
///
/// ```
/// use rand::SeedableRng;
/// use rand_chacha::ChaCha8Rng;
/// use voxel_augment_rs::{Sample, TransformPipeline, Volume};
///
/// # fn main() -> voxel_augment_rs::Result<()> {
/// let pipeline = TransformPipeline::training_default();
/// let image = Volume::zeros([1, 8, 8, 8])?;
/// let mask = Volume::zeros([1, 8, 8, 8])?;
/// let mut rng = ChaCha8Rng::seed_from_u64(0);
/// let out = pipeline.apply(Sample::new(image, mask, None)?, &mut rng)?;
/// assert_eq!(out.mask.channels(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Transform>", into = "Vec<Transform>")]
pub struct TransformPipeline {
    transforms: Vec<Transform>,
}

impl TransformPipeline {
    /// Validate and wrap a transform list.
    ///
    /// # Errors
    ///
    /// Returns [`AugmentError::InvalidProbability`] for a gate outside `[0, 1]`
    /// and [`AugmentError::InvalidConfig`] for bad parameters or ordering.
    pub fn new(transforms: Vec<Transform>) -> Result<Self> {
        let mut spatial_locked_by: Option<&'static str> = None;
        for (i, transform) in transforms.iter().enumerate() {
            transform.validate()?;

            let kind = transform.kind();
            if kind == TransformKind::Finalize && i + 1 != transforms.len() {
                return Err(AugmentError::invalid_config(format!(
                    "to_tensor must be the last transform, found at position {i} of {}",
                    transforms.len()
                )));
            }
            if kind.is_spatial() {
                if let Some(earlier) = spatial_locked_by {
                    return Err(AugmentError::invalid_config(format!(
                        "{} cannot run after {earlier}",
                        transform.name()
                    )));
                }
            }
            if matches!(
                kind,
                TransformKind::Derived | TransformKind::Normalize | TransformKind::Finalize
            ) && spatial_locked_by.is_none()
            {
                spatial_locked_by = Some(transform.name());
            }
        }
        Ok(Self { transforms })
    }

    /// A pipeline that returns samples unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    /// Training augmentation: intensity jitter, flips, rotations, noise,
    /// elastic warps, then edge/centroid channels, normalisation and
    /// conversion.
    #[must_use]
    pub fn training_default() -> Self {
        Self {
            transforms: vec![
                Transform::RandomContrastBrightness(RandomContrastBrightness::new(0.5)),
                Transform::Flip(Flip::new(0.5)),
                Transform::RandomRot90(RandomRot90::new(0.5)),
                Transform::RandomGaussianBlur(RandomGaussianBlur::new(0.5)),
                Transform::RandomGaussianNoise(RandomGaussianNoise::new(0.5)),
                Transform::RandomPoissonNoise(RandomPoissonNoise::new(0.5)),
                Transform::ElasticDeform(ElasticDeform::new(10.0, 0.5)),
                Transform::EdgesAndCentroids(EdgesAndCentroids::new(3, EdgeMode::Inner)),
                Transform::Normalize(Normalize::default()),
                Transform::ToTensor,
            ],
        }
    }

    /// Validation preprocessing: the deterministic tail only.
    #[must_use]
    pub fn validation_default() -> Self {
        Self::training_default().deterministic_only()
    }

    /// Keep only the deterministic transforms, in order.
    #[must_use]
    pub fn deterministic_only(&self) -> Self {
        Self {
            transforms: self
                .transforms
                .iter()
                .filter(|t| !t.is_stochastic())
                .cloned()
                .collect(),
        }
    }

    /// Transforms in application order.
    #[must_use]
    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Number of transforms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    /// Whether the pipeline has no transforms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Mask channels produced for a mask with `mask_channels` input channels.
    #[must_use]
    pub fn output_mask_channels(&self, mask_channels: usize) -> usize {
        let derived = self
            .transforms
            .iter()
            .filter(|t| t.kind() == TransformKind::Derived)
            .count();
        mask_channels + 2 * derived
    }

    /// Run every transform in order.
    ///
    /// One gate value is drawn from `rng` per transform; the transform fires
    /// when the draw is below its probability. Alignment is checked after
    /// every transform that fires.
    ///
    /// # Errors
    ///
    /// Propagates the first transform error, including
    /// [`AugmentError::ShapeMismatch`].
    pub fn apply<R: Rng + ?Sized>(&self, sample: Sample, rng: &mut R) -> Result<Sample> {
        let mut sample = sample;
        for transform in &self.transforms {
            let draw: f64 = rng.gen();
            if draw < transform.probability() {
                trace!(transform = transform.name(), "applying transform");
                sample = transform.apply(sample, rng)?;
            }
        }
        Ok(sample)
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::identity()
    }
}

impl TryFrom<Vec<Transform>> for TransformPipeline {
    type Error = AugmentError;

    fn try_from(transforms: Vec<Transform>) -> Result<Self> {
        Self::new(transforms)
    }
}

impl From<TransformPipeline> for Vec<Transform> {
    fn from(pipeline: TransformPipeline) -> Self {
        pipeline.transforms
    }
}
