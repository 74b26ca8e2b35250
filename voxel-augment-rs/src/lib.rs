//! # voxel-augment-rs
//!
//! Randomised 3D augmentation for volumetric segmentation data.
//!
//! Samples are image / mask / weight-map triples stored as dense
//! channel-first [`Volume`]s. A [`TransformPipeline`] applies an ordered list
//! of [`Transform`]s, each behind a probability gate, while keeping every
//! array of the sample spatially aligned.
//!
//! ## Features
//!
//! - **Geometric** - flips and quarter-turn rotations applied identically to
//!   image, mask and weight map
//! - **Intensity** - contrast/brightness jitter, Gaussian blur, Gaussian and
//!   Poisson noise on the image only
//! - **Elastic** - smooth random warps, labels resampled nearest-neighbour
//! - **Derived channels** - boundary and centroid maps from the final mask
//! - **Reproducible** - all randomness comes from the caller's RNG
//!
//! ## Quick Start
//!
//! ```rust
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//! use voxel_augment_rs::prelude::*;
//!
//! # fn main() -> voxel_augment_rs::Result<()> {
//! let pipeline = TransformPipeline::new(vec![
//!     Transform::Flip(Flip::new(0.5)),
//!     Transform::Normalize(Normalize::default()),
//!     Transform::ToTensor,
//! ])?;
//!
//! let image = Volume::zeros([1, 16, 16, 16])?;
//! let mask = Volume::zeros([1, 16, 16, 16])?;
//! let mut rng = ChaCha8Rng::seed_from_u64(42);
//! let sample = pipeline.apply(Sample::new(image, mask, None)?, &mut rng)?;
//! assert_eq!(sample.spatial(), [16, 16, 16]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod pipeline;
pub mod sample;
pub mod transform;
pub mod volume;

pub use error::{AugmentError, Result};
pub use pipeline::TransformPipeline;
pub use sample::Sample;
pub use transform::{AppliesTo, EdgeMode, Transform, TransformKind};
pub use volume::{Axis, Volume};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{AugmentError, Result};
    pub use crate::pipeline::TransformPipeline;
    pub use crate::sample::Sample;
    pub use crate::transform::{
        AppliesTo, EdgeMode, EdgesAndCentroids, ElasticDeform, Flip, Normalize,
        RandomContrastBrightness, RandomGaussianBlur, RandomGaussianNoise, RandomPoissonNoise,
        RandomRot90, Transform, TransformKind,
    };
    pub use crate::volume::Volume;
}
