//! Flips and quarter-turn rotations.
//!
//! Both transforms permute voxels without interpolation, so label masks keep
//! their exact class values.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AugmentError, Result};
use crate::sample::Sample;
use crate::volume::Axis;

use super::check_probability;

/// Mirror along one randomly chosen spatial axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flip {
    /// Apply probability.
    pub p: f64,
    /// Candidate spatial axes (0 = depth, 1 = height, 2 = width).
    pub axes: Vec<Axis>,
}

impl Default for Flip {
    fn default() -> Self {
        Self {
            p: 0.5,
            axes: vec![0, 1, 2],
        }
    }
}

impl Flip {
    /// Flip with the given probability over all three axes.
    #[must_use]
    pub fn new(p: f64) -> Self {
        Self {
            p,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_probability("flip", self.p)?;
        if self.axes.is_empty() || self.axes.iter().any(|&axis| axis > 2) {
            return Err(AugmentError::invalid_config(format!(
                "flip axes must be a non-empty subset of [0, 1, 2], got {:?}",
                self.axes
            )));
        }
        Ok(())
    }

    pub(crate) fn apply<R: Rng + ?Sized>(&self, sample: Sample, rng: &mut R) -> Result<Sample> {
        let axis = *self
            .axes
            .choose(rng)
            .ok_or_else(|| AugmentError::invalid_config("flip has no axes"))?;
        Ok(sample.map_geometry(|volume| volume.flip(axis)))
    }
}

/// Rotate by 90, 180 or 270 degrees in a randomly chosen plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomRot90 {
    /// Apply probability.
    pub p: f64,
    /// Candidate rotation planes as pairs of spatial axes.
    pub planes: Vec<(Axis, Axis)>,
}

impl Default for RandomRot90 {
    fn default() -> Self {
        Self {
            p: 0.5,
            planes: vec![(1, 2)],
        }
    }
}

impl RandomRot90 {
    /// Rotate in the (height, width) plane with the given probability.
    #[must_use]
    pub fn new(p: f64) -> Self {
        Self {
            p,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_probability("random_rot90", self.p)?;
        let valid = |&(a, b): &(Axis, Axis)| a < 3 && b < 3 && a != b;
        if self.planes.is_empty() || !self.planes.iter().all(valid) {
            return Err(AugmentError::invalid_config(format!(
                "rotation planes must be pairs of distinct axes in [0, 2], got {:?}",
                self.planes
            )));
        }
        Ok(())
    }

    pub(crate) fn apply<R: Rng + ?Sized>(&self, sample: Sample, rng: &mut R) -> Result<Sample> {
        let plane = *self
            .planes
            .choose(rng)
            .ok_or_else(|| AugmentError::invalid_config("random_rot90 has no planes"))?;
        let k = rng.gen_range(1..=3);
        Ok(sample.map_geometry(|volume| volume.rot90(plane, k)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn labelled_sample(spatial: [usize; 3]) -> Sample {
        let [d, h, w] = spatial;
        #[allow(clippy::cast_precision_loss)]
        let image = Volume::from_fn([1, d, h, w], |_, z, y, x| (z * 100 + y * 10 + x) as f32)
            .unwrap();
        let mask = Volume::from_fn([1, d, h, w], |_, z, y, x| ((z + y + x) % 3) as f32).unwrap();
        let weights = Volume::from_fn([1, d, h, w], |_, _, y, _| 1.0 + y as f32).unwrap();
        Sample::new(image, mask, Some(weights)).unwrap()
    }

    #[test]
    fn test_flip_keeps_arrays_aligned() {
        let flip = Flip::new(1.0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..6 {
            let out = flip.apply(labelled_sample([3, 4, 5]), &mut rng).unwrap();
            out.check_alignment("flip").unwrap();
            assert_eq!(out.spatial(), [3, 4, 5]);
        }
    }

    #[test]
    fn test_flip_moves_image_and_mask_together() {
        let flip = Flip {
            p: 1.0,
            axes: vec![2],
        };
        let sample = labelled_sample([2, 2, 3]);
        let mut rng = StdRng::seed_from_u64(0);
        let out = flip.apply(sample.clone(), &mut rng).unwrap();
        assert_eq!(out.image, sample.image.flip(2));
        assert_eq!(out.mask, sample.mask.flip(2));
        assert_eq!(out.weight_map, sample.weight_map.map(|w| w.flip(2)));
    }

    #[test]
    fn test_rot90_keeps_alignment_on_non_cubic_volume() {
        let rot = RandomRot90 {
            p: 1.0,
            planes: vec![(0, 1), (1, 2), (0, 2)],
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let out = rot.apply(labelled_sample([2, 3, 5]), &mut rng).unwrap();
            out.check_alignment("random_rot90").unwrap();
            let mut spatial = out.spatial();
            spatial.sort_unstable();
            assert_eq!(spatial, [2, 3, 5]);
        }
    }

    #[test]
    fn test_rot90_preserves_label_set() {
        let rot = RandomRot90::new(1.0);
        let sample = labelled_sample([2, 4, 4]);
        let mut rng = StdRng::seed_from_u64(3);
        let out = rot.apply(sample.clone(), &mut rng).unwrap();
        let mut before: Vec<f32> = sample.mask.data().to_vec();
        let mut after: Vec<f32> = out.mask.data().to_vec();
        before.sort_by(f32::total_cmp);
        after.sort_by(f32::total_cmp);
        assert_eq!(before, after);
    }

    #[test]
    fn test_validate_rejects_bad_axes() {
        let flip = Flip {
            p: 0.5,
            axes: vec![3],
        };
        assert!(flip.validate().is_err());
        let rot = RandomRot90 {
            p: 0.5,
            planes: vec![(1, 1)],
        };
        assert!(rot.validate().is_err());
    }
}
