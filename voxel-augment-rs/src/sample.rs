//! Image / mask / weight-map triples.

use crate::error::{AugmentError, Result};
use crate::volume::Volume;

/// One unit of training data.
///
/// Image and mask (and the weight map, when present) always share spatial
/// extents; channel counts may differ.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Input intensities, `[C_in, D, H, W]`.
    pub image: Volume,
    /// Label channels, `[C_mask, D, H, W]`.
    pub mask: Volume,
    /// Optional per-voxel loss weights, `[1 | C_mask, D, H, W]`.
    pub weight_map: Option<Volume>,
}

impl Sample {
    /// Create a sample, checking spatial alignment.
    ///
    /// # Errors
    ///
    /// Returns [`AugmentError::ShapeMismatch`] if the arrays are not aligned.
    pub fn new(image: Volume, mask: Volume, weight_map: Option<Volume>) -> Result<Self> {
        let sample = Self {
            image,
            mask,
            weight_map,
        };
        sample.check_alignment("construction")?;
        Ok(sample)
    }

    /// Spatial extents `[D, H, W]` shared by all arrays.
    #[must_use]
    pub fn spatial(&self) -> [usize; 3] {
        self.image.spatial()
    }

    /// Verify that mask and weight map match the image's spatial extents.
    ///
    /// # Errors
    ///
    /// Returns [`AugmentError::ShapeMismatch`] naming `transform` on divergence.
    pub fn check_alignment(&self, transform: &str) -> Result<()> {
        let image = self.image.spatial();
        let mismatch = |other: &'static str, got: [usize; 3]| AugmentError::ShapeMismatch {
            transform: transform.to_string(),
            image,
            other,
            got,
        };

        if self.mask.spatial() != image {
            return Err(mismatch("mask", self.mask.spatial()));
        }
        if let Some(weights) = &self.weight_map {
            if weights.spatial() != image {
                return Err(mismatch("weight_map", weights.spatial()));
            }
        }
        Ok(())
    }

    /// Apply the same geometric mapping to every array of the sample.
    pub(crate) fn map_geometry(self, f: impl Fn(&Volume) -> Volume) -> Sample {
        Sample {
            image: f(&self.image),
            mask: f(&self.mask),
            weight_map: self.weight_map.as_ref().map(&f),
        }
    }
}
