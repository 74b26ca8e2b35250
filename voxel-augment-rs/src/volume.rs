//! Dense channel-first 3D arrays.
//!
//! A [`Volume`] stores `C x D x H x W` voxels in row-major order. It is the
//! in-memory representation every transform works on; conversion to framework
//! tensors happens downstream once a batch is collated.

use crate::error::{AugmentError, Result};

/// Spatial axis index inside a volume (0 = depth, 1 = height, 2 = width).
pub type Axis = usize;

/// Dense `[C, D, H, W]` array of `f32` voxels.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl Volume {
    /// Create a volume from raw data.
    ///
    /// # Errors
    ///
    /// Returns [`AugmentError::InvalidShape`] if any extent is zero or the data
    /// length does not match the shape.
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Result<Self> {
        if shape.iter().any(|&extent| extent == 0) {
            return Err(AugmentError::invalid_shape(format!(
                "all extents must be non-zero, got {shape:?}"
            )));
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(AugmentError::invalid_shape(format!(
                "shape {shape:?} needs {expected} voxels, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Create a zero-filled volume.
    ///
    /// # Errors
    ///
    /// Returns an error if any extent is zero.
    pub fn zeros(shape: [usize; 4]) -> Result<Self> {
        Self::new(shape, vec![0.0; shape.iter().product()])
    }

    /// Create a volume by evaluating `f(c, z, y, x)` for every voxel.
    ///
    /// # Errors
    ///
    /// Returns an error if any extent is zero.
    pub fn from_fn(
        shape: [usize; 4],
        mut f: impl FnMut(usize, usize, usize, usize) -> f32,
    ) -> Result<Self> {
        let [c_n, d, h, w] = shape;
        let mut data = Vec::with_capacity(shape.iter().product());
        for c in 0..c_n {
            for z in 0..d {
                for y in 0..h {
                    for x in 0..w {
                        data.push(f(c, z, y, x));
                    }
                }
            }
        }
        Self::new(shape, data)
    }

    /// Full `[C, D, H, W]` shape.
    #[must_use]
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    /// Number of channels.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    /// Spatial extents `[D, H, W]`.
    #[must_use]
    pub fn spatial(&self) -> [usize; 3] {
        [self.shape[1], self.shape[2], self.shape[3]]
    }

    /// Number of voxels in a single channel.
    #[must_use]
    pub fn voxels_per_channel(&self) -> usize {
        self.shape[1] * self.shape[2] * self.shape[3]
    }

    /// Raw voxel data.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable raw voxel data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the volume, returning its voxel buffer.
    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Voxels of one channel.
    ///
    /// # Panics
    ///
    /// Panics if `c` is out of range.
    #[must_use]
    pub fn channel(&self, c: usize) -> &[f32] {
        let n = self.voxels_per_channel();
        &self.data[c * n..(c + 1) * n]
    }

    /// Mutable voxels of one channel.
    ///
    /// # Panics
    ///
    /// Panics if `c` is out of range.
    pub fn channel_mut(&mut self, c: usize) -> &mut [f32] {
        let n = self.voxels_per_channel();
        &mut self.data[c * n..(c + 1) * n]
    }

    #[inline]
    fn offset(&self, c: usize, z: usize, y: usize, x: usize) -> usize {
        ((c * self.shape[1] + z) * self.shape[2] + y) * self.shape[3] + x
    }

    /// Read one voxel.
    #[inline]
    #[must_use]
    pub fn get(&self, c: usize, z: usize, y: usize, x: usize) -> f32 {
        self.data[self.offset(c, z, y, x)]
    }

    /// Write one voxel.
    #[inline]
    pub fn set(&mut self, c: usize, z: usize, y: usize, x: usize, value: f32) {
        let idx = self.offset(c, z, y, x);
        self.data[idx] = value;
    }

    /// Apply `f` to every voxel in place.
    pub fn map_inplace(&mut self, f: impl FnMut(&mut f32)) {
        self.data.iter_mut().for_each(f);
    }

    /// Stack volumes along the channel axis.
    ///
    /// # Errors
    ///
    /// Returns an error if `parts` is empty or spatial extents differ.
    pub fn concat_channels(parts: &[Volume]) -> Result<Volume> {
        let first = parts
            .first()
            .ok_or_else(|| AugmentError::invalid_shape("cannot concatenate zero volumes"))?;
        let spatial = first.spatial();
        let mut channels = 0;
        for part in parts {
            if part.spatial() != spatial {
                return Err(AugmentError::invalid_shape(format!(
                    "cannot concatenate spatial extents {:?} and {:?}",
                    spatial,
                    part.spatial()
                )));
            }
            channels += part.channels();
        }
        let mut data = Vec::with_capacity(channels * first.voxels_per_channel());
        for part in parts {
            data.extend_from_slice(&part.data);
        }
        Volume::new([channels, spatial[0], spatial[1], spatial[2]], data)
    }

    /// Mirror the volume along one spatial axis.
    ///
    /// # Panics
    ///
    /// Panics if `axis > 2`.
    #[must_use]
    pub fn flip(&self, axis: Axis) -> Volume {
        assert!(axis < 3, "spatial axis out of range: {axis}");
        let spatial = self.spatial();
        let extent = spatial[axis];
        let mut out = self.data.clone();
        for c in 0..self.channels() {
            for z in 0..spatial[0] {
                for y in 0..spatial[1] {
                    for x in 0..spatial[2] {
                        let mut src = [z, y, x];
                        src[axis] = extent - 1 - src[axis];
                        out[self.offset(c, z, y, x)] = self.get(c, src[0], src[1], src[2]);
                    }
                }
            }
        }
        Volume {
            shape: self.shape,
            data: out,
        }
    }

    /// Rotate by `k` quarter turns in the plane spanned by two spatial axes.
    ///
    /// Matches the orientation convention of `numpy.rot90(m, k, axes)`: the
    /// first axis of the plane rotates towards the second. Odd `k` swaps the
    /// two in-plane extents.
    ///
    /// # Panics
    ///
    /// Panics if the plane axes are equal or out of range.
    #[must_use]
    pub fn rot90(&self, plane: (Axis, Axis), k: usize) -> Volume {
        let (a, b) = plane;
        assert!(a < 3 && b < 3 && a != b, "invalid rotation plane {plane:?}");
        let k = k % 4;
        let input = self.spatial();
        let mut output = input;
        if k % 2 == 1 {
            output.swap(a, b);
        }

        let shape = [self.channels(), output[0], output[1], output[2]];
        let mut data = Vec::with_capacity(self.data.len());
        for c in 0..self.channels() {
            for z in 0..output[0] {
                for y in 0..output[1] {
                    for x in 0..output[2] {
                        let o = [z, y, x];
                        let mut s = o;
                        match k {
                            1 => {
                                s[a] = o[b];
                                s[b] = input[b] - 1 - o[a];
                            }
                            2 => {
                                s[a] = input[a] - 1 - o[a];
                                s[b] = input[b] - 1 - o[b];
                            }
                            3 => {
                                s[a] = input[a] - 1 - o[b];
                                s[b] = o[a];
                            }
                            _ => {}
                        }
                        data.push(self.get(c, s[0], s[1], s[2]));
                    }
                }
            }
        }
        Volume { shape, data }
    }

    /// Nearest-neighbour lookup at a fractional position, clamped to the edge.
    #[must_use]
    pub fn sample_nearest(&self, c: usize, z: f32, y: f32, x: f32) -> f32 {
        let [d, h, w] = self.spatial();
        let zi = clamp_index(z.round(), d);
        let yi = clamp_index(y.round(), h);
        let xi = clamp_index(x.round(), w);
        self.get(c, zi, yi, xi)
    }

    /// Trilinear interpolation at a fractional position, clamped to the edge.
    #[must_use]
    pub fn sample_linear(&self, c: usize, z: f32, y: f32, x: f32) -> f32 {
        let [d, h, w] = self.spatial();
        let (z0, z1, fz) = bracket(z, d);
        let (y0, y1, fy) = bracket(y, h);
        let (x0, x1, fx) = bracket(x, w);

        let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
        let c00 = lerp(self.get(c, z0, y0, x0), self.get(c, z0, y0, x1), fx);
        let c01 = lerp(self.get(c, z0, y1, x0), self.get(c, z0, y1, x1), fx);
        let c10 = lerp(self.get(c, z1, y0, x0), self.get(c, z1, y0, x1), fx);
        let c11 = lerp(self.get(c, z1, y1, x0), self.get(c, z1, y1, x1), fx);
        lerp(lerp(c00, c01, fy), lerp(c10, c11, fy), fz)
    }

    /// Mean and population standard deviation of one channel.
    #[must_use]
    pub fn channel_stats(&self, c: usize) -> (f32, f32) {
        let voxels = self.channel(c);
        #[allow(clippy::cast_precision_loss)]
        let n = voxels.len() as f64;
        let mean = voxels.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let var = voxels
            .iter()
            .map(|&v| {
                let diff = f64::from(v) - mean;
                diff * diff
            })
            .sum::<f64>()
            / n;
        #[allow(clippy::cast_possible_truncation)]
        (mean as f32, var.sqrt() as f32)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_index(pos: f32, extent: usize) -> usize {
    if pos <= 0.0 || pos.is_nan() {
        0
    } else {
        (pos as usize).min(extent - 1)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn bracket(pos: f32, extent: usize) -> (usize, usize, f32) {
    let max = (extent - 1) as f32;
    let pos = if pos.is_nan() { 0.0 } else { pos.clamp(0.0, max) };
    let lo = pos.floor();
    let lo_idx = lo as usize;
    let hi_idx = (lo_idx + 1).min(extent - 1);
    (lo_idx, hi_idx, pos - lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: [usize; 4]) -> Volume {
        #[allow(clippy::cast_precision_loss)]
        let data = (0..shape.iter().product::<usize>()).map(|v| v as f32).collect();
        Volume::new(shape, data).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let result = Volume::new([1, 2, 2, 2], vec![0.0; 7]);
        assert!(matches!(result, Err(AugmentError::InvalidShape(_))));
    }

    #[test]
    fn test_new_rejects_zero_extent() {
        assert!(Volume::zeros([1, 0, 2, 2]).is_err());
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut volume = Volume::zeros([2, 3, 4, 5]).unwrap();
        volume.set(1, 2, 3, 4, 7.5);
        assert_eq!(volume.get(1, 2, 3, 4), 7.5);
        assert_eq!(volume.data().last().copied(), Some(7.5));
    }

    #[test]
    fn test_flip_is_involution() {
        let volume = ramp([2, 3, 4, 5]);
        for axis in 0..3 {
            let flipped = volume.flip(axis);
            assert_ne!(flipped, volume);
            assert_eq!(flipped.flip(axis), volume);
        }
    }

    #[test]
    fn test_flip_width_reverses_rows() {
        let volume = ramp([1, 1, 1, 4]);
        assert_eq!(volume.flip(2).data(), &[3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_rot90_matches_numpy_convention() {
        // [[0, 1, 2], [3, 4, 5]] rotated once in (H, W) -> [[2, 5], [1, 4], [0, 3]]
        let volume = ramp([1, 1, 2, 3]);
        let rotated = volume.rot90((1, 2), 1);
        assert_eq!(rotated.shape(), [1, 1, 3, 2]);
        assert_eq!(rotated.data(), &[2.0, 5.0, 1.0, 4.0, 0.0, 3.0]);
    }

    #[test]
    fn test_rot90_four_turns_is_identity() {
        let volume = ramp([2, 2, 3, 4]);
        let mut rotated = volume.clone();
        for _ in 0..4 {
            rotated = rotated.rot90((0, 2), 1);
        }
        assert_eq!(rotated, volume);
        assert_eq!(volume.rot90((1, 2), 1).rot90((1, 2), 3), volume);
    }

    #[test]
    fn test_concat_channels() {
        let a = Volume::zeros([1, 2, 2, 2]).unwrap();
        let b = Volume::new([2, 2, 2, 2], vec![1.0; 16]).unwrap();
        let joined = Volume::concat_channels(&[a, b]).unwrap();
        assert_eq!(joined.shape(), [3, 2, 2, 2]);
        assert_eq!(joined.channel(0), &[0.0; 8]);
        assert_eq!(joined.channel(2), &[1.0; 8]);
    }

    #[test]
    fn test_concat_channels_rejects_spatial_mismatch() {
        let a = Volume::zeros([1, 2, 2, 2]).unwrap();
        let b = Volume::zeros([1, 2, 2, 3]).unwrap();
        assert!(Volume::concat_channels(&[a, b]).is_err());
    }

    #[test]
    fn test_sampling_at_grid_points() {
        let volume = ramp([1, 3, 3, 3]);
        for (z, y, x) in [(0, 0, 0), (1, 2, 1), (2, 2, 2)] {
            #[allow(clippy::cast_precision_loss)]
            let (zf, yf, xf) = (z as f32, y as f32, x as f32);
            assert_eq!(volume.sample_linear(0, zf, yf, xf), volume.get(0, z, y, x));
            assert_eq!(volume.sample_nearest(0, zf, yf, xf), volume.get(0, z, y, x));
        }
    }

    #[test]
    fn test_sample_linear_midpoint_and_clamp() {
        let volume = ramp([1, 1, 1, 2]);
        assert!((volume.sample_linear(0, 0.0, 0.0, 0.5) - 0.5).abs() < 1e-6);
        assert_eq!(volume.sample_linear(0, 0.0, 0.0, 10.0), 1.0);
        assert_eq!(volume.sample_nearest(0, -3.0, 0.0, -1.0), 0.0);
    }

    #[test]
    fn test_channel_stats() {
        let volume = Volume::new([1, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let (mean, std) = volume.channel_stats(0);
        assert!((mean - 2.5).abs() < 1e-6);
        assert!((std - 1.118_034).abs() < 1e-5);
    }
}
