//! Intensity jitter, blur and noise. These touch the image only.

use rand::Rng;
use rand_distr::{Distribution, Poisson, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{AugmentError, Result};
use crate::sample::Sample;
use crate::volume::Volume;

use super::{check_probability, check_range, uniform};

/// Random contrast scaling around the channel mean plus a brightness shift.
///
/// `x' = (x - mean) * alpha + mean + beta * std`, with `alpha` drawn from
/// `contrast` and `beta` from `brightness`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomContrastBrightness {
    /// Apply probability.
    pub p: f64,
    /// Range of the contrast factor `alpha`.
    pub contrast: (f32, f32),
    /// Range of the brightness shift `beta`, in units of channel std.
    pub brightness: (f32, f32),
}

impl Default for RandomContrastBrightness {
    fn default() -> Self {
        Self {
            p: 0.5,
            contrast: (0.8, 1.2),
            brightness: (-0.1, 0.1),
        }
    }
}

impl RandomContrastBrightness {
    /// Default ranges with the given probability.
    #[must_use]
    pub fn new(p: f64) -> Self {
        Self {
            p,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_probability("random_contrast_brightness", self.p)?;
        check_range("contrast", self.contrast)?;
        check_range("brightness", self.brightness)?;
        if self.contrast.0 < 0.0 {
            return Err(AugmentError::invalid_config("contrast factor must be >= 0"));
        }
        Ok(())
    }

    pub(crate) fn apply<R: Rng + ?Sized>(&self, mut sample: Sample, rng: &mut R) -> Result<Sample> {
        let alpha = uniform(rng, self.contrast);
        let beta = uniform(rng, self.brightness);
        for c in 0..sample.image.channels() {
            let (mean, std) = sample.image.channel_stats(c);
            for v in sample.image.channel_mut(c) {
                *v = (*v - mean) * alpha + mean + beta * std;
            }
        }
        Ok(sample)
    }
}

/// Separable 3D Gaussian blur with a random sigma.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomGaussianBlur {
    /// Apply probability.
    pub p: f64,
    /// Range of the kernel standard deviation, in voxels.
    pub sigma: (f32, f32),
}

impl Default for RandomGaussianBlur {
    fn default() -> Self {
        Self {
            p: 0.5,
            sigma: (0.5, 1.5),
        }
    }
}

impl RandomGaussianBlur {
    /// Default sigma range with the given probability.
    #[must_use]
    pub fn new(p: f64) -> Self {
        Self {
            p,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_probability("random_gaussian_blur", self.p)?;
        check_range("sigma", self.sigma)?;
        if self.sigma.0 <= 0.0 {
            return Err(AugmentError::invalid_config("blur sigma must be > 0"));
        }
        Ok(())
    }

    pub(crate) fn apply<R: Rng + ?Sized>(&self, mut sample: Sample, rng: &mut R) -> Result<Sample> {
        let sigma = uniform(rng, self.sigma);
        gaussian_blur(&mut sample.image, sigma);
        Ok(sample)
    }
}

/// Build a normalised 1D Gaussian kernel with radius `ceil(3 sigma)`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub(crate) fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let offset = i as f32 - radius as f32;
            (-(offset * offset) / denom).exp()
        })
        .collect();
    let total: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= total);
    kernel
}

/// Blur every channel of `volume` in place along all three spatial axes.
pub(crate) fn gaussian_blur(volume: &mut Volume, sigma: f32) {
    let kernel = gaussian_kernel(sigma);
    let spatial = volume.spatial();
    for c in 0..volume.channels() {
        let channel = volume.channel_mut(c);
        for axis in 0..3 {
            convolve_axis(channel, spatial, axis, &kernel);
        }
    }
}

fn convolve_axis(channel: &mut [f32], spatial: [usize; 3], axis: usize, kernel: &[f32]) {
    let [d, h, w] = spatial;
    let extent = spatial[axis];
    if extent == 1 {
        return;
    }
    let strides = [h * w, w, 1];
    let stride = strides[axis];
    let radius = kernel.len() / 2;
    let source = channel.to_vec();

    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let pos = [z, y, x][axis];
                let base = z * strides[0] + y * strides[1] + x - pos * stride;
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let idx = (pos + k).saturating_sub(radius).min(extent - 1);
                    acc += weight * source[base + idx * stride];
                }
                channel[z * strides[0] + y * strides[1] + x] = acc;
            }
        }
    }
}

/// Additive zero-mean Gaussian noise scaled by the channel std.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomGaussianNoise {
    /// Apply probability.
    pub p: f64,
    /// Range of the noise std, relative to the channel std.
    pub std: (f32, f32),
}

impl Default for RandomGaussianNoise {
    fn default() -> Self {
        Self {
            p: 0.5,
            std: (0.0, 0.1),
        }
    }
}

impl RandomGaussianNoise {
    /// Default noise range with the given probability.
    #[must_use]
    pub fn new(p: f64) -> Self {
        Self {
            p,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_probability("random_gaussian_noise", self.p)?;
        check_range("std", self.std)?;
        if self.std.0 < 0.0 {
            return Err(AugmentError::invalid_config("noise std must be >= 0"));
        }
        Ok(())
    }

    pub(crate) fn apply<R: Rng + ?Sized>(&self, mut sample: Sample, rng: &mut R) -> Result<Sample> {
        let relative = uniform(rng, self.std);
        for c in 0..sample.image.channels() {
            let (_, channel_std) = sample.image.channel_stats(c);
            // constant channels get noise in absolute units
            let scale = if channel_std > 0.0 { channel_std } else { 1.0 };
            let sigma = relative * scale;
            for v in sample.image.channel_mut(c) {
                let n: f32 = rng.sample(StandardNormal);
                *v += n * sigma;
            }
        }
        Ok(sample)
    }
}

/// Shot noise: non-negative voxels are resampled as `Poisson(x * peak) / peak`.
///
/// Lower `peak` values give stronger noise. Negative voxels are left as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomPoissonNoise {
    /// Apply probability.
    pub p: f64,
    /// Range of the photon-count scale.
    pub peak: (f32, f32),
}

impl Default for RandomPoissonNoise {
    fn default() -> Self {
        Self {
            p: 0.5,
            peak: (10.0, 100.0),
        }
    }
}

impl RandomPoissonNoise {
    /// Default peak range with the given probability.
    #[must_use]
    pub fn new(p: f64) -> Self {
        Self {
            p,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_probability("random_poisson_noise", self.p)?;
        check_range("peak", self.peak)?;
        if self.peak.0 <= 0.0 {
            return Err(AugmentError::invalid_config("poisson peak must be > 0"));
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn apply<R: Rng + ?Sized>(&self, mut sample: Sample, rng: &mut R) -> Result<Sample> {
        let peak = f64::from(uniform(rng, self.peak));
        for v in sample.image.data_mut() {
            let lambda = f64::from(*v) * peak;
            if lambda > 0.0 && lambda.is_finite() {
                let dist = Poisson::new(lambda)
                    .map_err(|e| AugmentError::invalid_config(format!("poisson noise: {e}")))?;
                let counts: f64 = dist.sample(rng);
                *v = (counts / peak) as f32;
            }
        }
        Ok(sample)
    }
}
