//! The closed set of augmentation transforms.
//!
//! Every transform is one variant of [`Transform`]. The enum is serde-tagged
//! so pipelines can be declared in configuration files:
//!
//! ```yaml
//! - type: flip
//!   p: 0.5
//! - type: elastic_deform
//!   sigma: 10.0
//! - type: normalize
//! - type: to_tensor
//! ```

mod edges;
mod elastic;
mod geometric;
mod intensity;
mod normalize;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AugmentError, Result};
use crate::sample::Sample;

pub use edges::{EdgeMode, EdgesAndCentroids};
pub use elastic::ElasticDeform;
pub use geometric::{Flip, RandomRot90};
pub use intensity::{
    RandomContrastBrightness, RandomGaussianBlur, RandomGaussianNoise, RandomPoissonNoise,
};
pub use normalize::Normalize;

/// Which arrays of a [`Sample`] a transform modifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliesTo {
    /// Image only.
    Image,
    /// Mask only.
    Mask,
    /// Image, mask and weight map together.
    Both,
}

/// Coarse category of a transform, used for ordering rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Voxel permutations (flip, rotation).
    Geometric,
    /// Image intensity changes.
    Intensity,
    /// Smooth spatial warps.
    Elastic,
    /// Channels derived from the mask.
    Derived,
    /// Image standardisation.
    Normalize,
    /// Final conversion step.
    Finalize,
}

impl TransformKind {
    /// Whether this kind moves voxels spatially.
    #[must_use]
    pub fn is_spatial(self) -> bool {
        matches!(self, Self::Geometric | Self::Elastic)
    }
}

/// One augmentation operation with its probability gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// See [`Flip`].
    Flip(Flip),
    /// See [`RandomRot90`].
    RandomRot90(RandomRot90),
    /// See [`RandomContrastBrightness`].
    RandomContrastBrightness(RandomContrastBrightness),
    /// See [`RandomGaussianBlur`].
    RandomGaussianBlur(RandomGaussianBlur),
    /// See [`RandomGaussianNoise`].
    RandomGaussianNoise(RandomGaussianNoise),
    /// See [`RandomPoissonNoise`].
    RandomPoissonNoise(RandomPoissonNoise),
    /// See [`ElasticDeform`].
    ElasticDeform(ElasticDeform),
    /// See [`EdgesAndCentroids`].
    EdgesAndCentroids(EdgesAndCentroids),
    /// See [`Normalize`].
    Normalize(Normalize),
    /// Binarise the mask and hand the sample over as model input.
    ToTensor,
}

impl Transform {
    /// Stable snake_case name, matching the serde tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Flip(_) => "flip",
            Self::RandomRot90(_) => "random_rot90",
            Self::RandomContrastBrightness(_) => "random_contrast_brightness",
            Self::RandomGaussianBlur(_) => "random_gaussian_blur",
            Self::RandomGaussianNoise(_) => "random_gaussian_noise",
            Self::RandomPoissonNoise(_) => "random_poisson_noise",
            Self::ElasticDeform(_) => "elastic_deform",
            Self::EdgesAndCentroids(_) => "edges_and_centroids",
            Self::Normalize(_) => "normalize",
            Self::ToTensor => "to_tensor",
        }
    }

    /// Probability that the transform fires. Deterministic transforms report 1.
    #[must_use]
    pub fn probability(&self) -> f64 {
        match self {
            Self::Flip(t) => t.p,
            Self::RandomRot90(t) => t.p,
            Self::RandomContrastBrightness(t) => t.p,
            Self::RandomGaussianBlur(t) => t.p,
            Self::RandomGaussianNoise(t) => t.p,
            Self::RandomPoissonNoise(t) => t.p,
            Self::ElasticDeform(t) => t.p,
            Self::EdgesAndCentroids(_) | Self::Normalize(_) | Self::ToTensor => 1.0,
        }
    }

    /// Override the probability gate of a stochastic transform.
    ///
    /// Deterministic transforms are returned unchanged.
    #[must_use]
    pub fn with_probability(mut self, p: f64) -> Self {
        match &mut self {
            Self::Flip(t) => t.p = p,
            Self::RandomRot90(t) => t.p = p,
            Self::RandomContrastBrightness(t) => t.p = p,
            Self::RandomGaussianBlur(t) => t.p = p,
            Self::RandomGaussianNoise(t) => t.p = p,
            Self::RandomPoissonNoise(t) => t.p = p,
            Self::ElasticDeform(t) => t.p = p,
            Self::EdgesAndCentroids(_) | Self::Normalize(_) | Self::ToTensor => {}
        }
        self
    }

    /// Arrays touched by this transform.
    #[must_use]
    pub fn applies_to(&self) -> AppliesTo {
        match self.kind() {
            TransformKind::Geometric | TransformKind::Elastic | TransformKind::Finalize => {
                AppliesTo::Both
            }
            TransformKind::Intensity | TransformKind::Normalize => AppliesTo::Image,
            TransformKind::Derived => AppliesTo::Mask,
        }
    }

    /// Category of this transform.
    #[must_use]
    pub fn kind(&self) -> TransformKind {
        match self {
            Self::Flip(_) | Self::RandomRot90(_) => TransformKind::Geometric,
            Self::RandomContrastBrightness(_)
            | Self::RandomGaussianBlur(_)
            | Self::RandomGaussianNoise(_)
            | Self::RandomPoissonNoise(_) => TransformKind::Intensity,
            Self::ElasticDeform(_) => TransformKind::Elastic,
            Self::EdgesAndCentroids(_) => TransformKind::Derived,
            Self::Normalize(_) => TransformKind::Normalize,
            Self::ToTensor => TransformKind::Finalize,
        }
    }

    /// Whether the transform draws random numbers beyond its gate.
    #[must_use]
    pub fn is_stochastic(&self) -> bool {
        matches!(
            self.kind(),
            TransformKind::Geometric | TransformKind::Intensity | TransformKind::Elastic
        )
    }

    /// Check parameters.
    ///
    /// # Errors
    ///
    /// Returns [`AugmentError::InvalidProbability`] or
    /// [`AugmentError::InvalidConfig`] for out-of-range parameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Flip(t) => t.validate(),
            Self::RandomRot90(t) => t.validate(),
            Self::RandomContrastBrightness(t) => t.validate(),
            Self::RandomGaussianBlur(t) => t.validate(),
            Self::RandomGaussianNoise(t) => t.validate(),
            Self::RandomPoissonNoise(t) => t.validate(),
            Self::ElasticDeform(t) => t.validate(),
            Self::EdgesAndCentroids(t) => t.validate(),
            Self::Normalize(t) => t.validate(),
            Self::ToTensor => Ok(()),
        }
    }

    /// Apply the transform unconditionally. The probability gate lives in
    /// [`crate::TransformPipeline::apply`].
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be transformed, or
    /// [`AugmentError::ShapeMismatch`] if the result is misaligned.
    pub fn apply<R: Rng + ?Sized>(&self, sample: Sample, rng: &mut R) -> Result<Sample> {
        let out = match self {
            Self::Flip(t) => t.apply(sample, rng),
            Self::RandomRot90(t) => t.apply(sample, rng),
            Self::RandomContrastBrightness(t) => t.apply(sample, rng),
            Self::RandomGaussianBlur(t) => t.apply(sample, rng),
            Self::RandomGaussianNoise(t) => t.apply(sample, rng),
            Self::RandomPoissonNoise(t) => t.apply(sample, rng),
            Self::ElasticDeform(t) => t.apply(sample, rng),
            Self::EdgesAndCentroids(t) => t.apply(sample),
            Self::Normalize(t) => Ok(t.apply(sample)),
            Self::ToTensor => normalize::to_tensor(sample),
        }?;
        out.check_alignment(self.name())?;
        Ok(out)
    }
}

pub(crate) fn check_probability(transform: &str, p: f64) -> Result<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(AugmentError::InvalidProbability {
            transform: transform.to_string(),
            probability: p,
        })
    }
}

pub(crate) fn check_range(field: &str, (lo, hi): (f32, f32)) -> Result<()> {
    if lo.is_finite() && hi.is_finite() && lo <= hi {
        Ok(())
    } else {
        Err(AugmentError::invalid_config(format!(
            "{field} range must be finite with low <= high, got ({lo}, {hi})"
        )))
    }
}

/// Draw uniformly from `[lo, hi)`; degenerate ranges return `lo`.
pub(crate) fn uniform<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_probability_bounds() {
        assert!(check_probability("flip", 0.0).is_ok());
        assert!(check_probability("flip", 1.0).is_ok());
        assert!(check_probability("flip", -0.1).is_err());
        assert!(check_probability("flip", f64::NAN).is_err());
        assert!(matches!(
            check_probability("flip", 1.01),
            Err(AugmentError::InvalidProbability { .. })
        ));
    }

    #[test]
    fn test_applies_to_by_kind() {
        assert_eq!(Transform::Flip(Flip::default()).applies_to(), AppliesTo::Both);
        assert_eq!(
            Transform::RandomGaussianNoise(RandomGaussianNoise::default()).applies_to(),
            AppliesTo::Image
        );
        assert_eq!(
            Transform::EdgesAndCentroids(EdgesAndCentroids::default()).applies_to(),
            AppliesTo::Mask
        );
        assert_eq!(Transform::ToTensor.applies_to(), AppliesTo::Both);
    }

    #[test]
    fn test_deterministic_transforms_have_unit_probability() {
        for t in [
            Transform::EdgesAndCentroids(EdgesAndCentroids::default()),
            Transform::Normalize(Normalize::default()),
            Transform::ToTensor,
        ] {
            assert!(!t.is_stochastic());
            assert_eq!(t.probability(), 1.0);
            assert_eq!(t.clone().with_probability(0.0), t);
        }
    }

    #[test]
    fn test_serde_tagged_yaml() {
        let yaml = "
- type: flip
  p: 0.25
- type: random_rot90
- type: edges_and_centroids
  mode: thick
- type: normalize
- type: to_tensor
";
        let transforms: Vec<Transform> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(transforms.len(), 5);
        assert_eq!(transforms[0].probability(), 0.25);
        assert_eq!(transforms[1], Transform::RandomRot90(RandomRot90::default()));
        match &transforms[2] {
            Transform::EdgesAndCentroids(t) => {
                assert_eq!(t.mode, EdgeMode::Thick);
                assert_eq!(t.iterations, 3);
            }
            other => panic!("unexpected transform {other:?}"),
        }
        assert_eq!(transforms[4], Transform::ToTensor);

        let back = serde_yaml::to_string(&transforms).unwrap();
        assert!(back.contains("type: random_rot90"));
    }

    #[test]
    fn test_uniform_degenerate_range() {
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        assert_eq!(uniform(&mut rng, (0.3, 0.3)), 0.3);
    }
}
