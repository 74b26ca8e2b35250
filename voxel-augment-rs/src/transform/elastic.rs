//! Smooth random displacement fields.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{AugmentError, Result};
use crate::sample::Sample;
use crate::volume::Volume;

use super::check_probability;

/// Elastic deformation driven by a coarse random control grid.
///
/// Each of the `points³` control points gets an `N(0, sigma)` displacement
/// per spatial axis. The grid is trilinearly upsampled to a dense field, the
/// image is resampled trilinearly and the mask and weight map with nearest
/// neighbour lookups, so label values never become fractional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticDeform {
    /// Apply probability.
    pub p: f64,
    /// Displacement std at the control points, in voxels.
    pub sigma: f32,
    /// Control points per axis.
    pub points: usize,
}

impl Default for ElasticDeform {
    fn default() -> Self {
        Self {
            p: 0.5,
            sigma: 10.0,
            points: 3,
        }
    }
}

impl ElasticDeform {
    /// Default grid with the given displacement scale and probability.
    #[must_use]
    pub fn new(sigma: f32, p: f64) -> Self {
        Self {
            p,
            sigma,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_probability("elastic_deform", self.p)?;
        if !self.sigma.is_finite() || self.sigma < 0.0 {
            return Err(AugmentError::invalid_config(format!(
                "elastic sigma must be finite and >= 0, got {}",
                self.sigma
            )));
        }
        if self.points < 2 {
            return Err(AugmentError::invalid_config(format!(
                "elastic grid needs at least 2 points per axis, got {}",
                self.points
            )));
        }
        Ok(())
    }

    pub(crate) fn apply<R: Rng + ?Sized>(&self, sample: Sample, rng: &mut R) -> Result<Sample> {
        let field = self.displacement_field(sample.spatial(), rng)?;
        let weight_map = match &sample.weight_map {
            Some(w) => Some(warp(w, &field, Volume::sample_nearest)?),
            None => None,
        };
        Ok(Sample {
            image: warp(&sample.image, &field, Volume::sample_linear)?,
            mask: warp(&sample.mask, &field, Volume::sample_nearest)?,
            weight_map,
        })
    }

    /// Dense `[3, D, H, W]` displacement field in voxel units.
    #[allow(clippy::cast_precision_loss)]
    fn displacement_field<R: Rng + ?Sized>(
        &self,
        spatial: [usize; 3],
        rng: &mut R,
    ) -> Result<Volume> {
        let normal = Normal::new(0.0_f32, self.sigma)
            .map_err(|e| AugmentError::invalid_config(format!("elastic sigma: {e}")))?;
        let n = self.points;
        let grid = Volume::from_fn([3, n, n, n], |axis, _, _, _| {
            // a singleton axis cannot move
            if spatial[axis] > 1 {
                normal.sample(&mut *rng)
            } else {
                0.0
            }
        })?;

        let scale = |extent: usize| {
            if extent > 1 {
                (n - 1) as f32 / (extent - 1) as f32
            } else {
                0.0
            }
        };
        let [sz, sy, sx] = [scale(spatial[0]), scale(spatial[1]), scale(spatial[2])];
        let [d, h, w] = spatial;
        Volume::from_fn([3, d, h, w], |axis, z, y, x| {
            grid.sample_linear(axis, z as f32 * sz, y as f32 * sy, x as f32 * sx)
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn warp(
    volume: &Volume,
    field: &Volume,
    lookup: fn(&Volume, usize, f32, f32, f32) -> f32,
) -> Result<Volume> {
    Volume::from_fn(volume.shape(), |c, z, y, x| {
        let zs = z as f32 + field.get(0, z, y, x);
        let ys = y as f32 + field.get(1, z, y, x);
        let xs = x as f32 + field.get(2, z, y, x);
        lookup(volume, c, zs, ys, xs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample() -> Sample {
        #[allow(clippy::cast_precision_loss)]
        let image = Volume::from_fn([2, 6, 7, 8], |c, z, y, x| (c + z + y + x) as f32).unwrap();
        let mask = Volume::from_fn([1, 6, 7, 8], |_, z, y, _| {
            if (2..5).contains(&z) && y > 3 {
                2.0
            } else {
                0.0
            }
        })
        .unwrap();
        let weights = Volume::new([1, 6, 7, 8], vec![1.5; 6 * 7 * 8]).unwrap();
        Sample::new(image, mask, Some(weights)).unwrap()
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        let deform = ElasticDeform::new(0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(4);
        let original = sample();
        let out = deform.apply(original.clone(), &mut rng).unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn test_mask_values_stay_in_label_set() {
        let deform = ElasticDeform::new(3.0, 1.0);
        let mut rng = StdRng::seed_from_u64(21);
        let out = deform.apply(sample(), &mut rng).unwrap();
        out.check_alignment("elastic_deform").unwrap();
        assert!(out.mask.data().iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(out
            .weight_map
            .unwrap()
            .data()
            .iter()
            .all(|&v| (v - 1.5).abs() < f32::EPSILON));
    }

    #[test]
    fn test_same_seed_same_warp() {
        let deform = ElasticDeform::default();
        let a = deform
            .apply(sample(), &mut StdRng::seed_from_u64(8))
            .unwrap();
        let b = deform
            .apply(sample(), &mut StdRng::seed_from_u64(8))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_singleton_axis_is_not_displaced() {
        let deform = ElasticDeform::new(5.0, 1.0);
        let mut rng = StdRng::seed_from_u64(2);
        let field = deform.displacement_field([1, 5, 5], &mut rng).unwrap();
        assert!(field.channel(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_validate() {
        assert!(ElasticDeform::default().validate().is_ok());
        assert!(ElasticDeform::new(-1.0, 0.5).validate().is_err());
        let coarse = ElasticDeform {
            points: 1,
            ..ElasticDeform::default()
        };
        assert!(coarse.validate().is_err());
    }
}
