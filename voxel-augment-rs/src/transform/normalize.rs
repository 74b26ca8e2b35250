//! Deterministic tail of a pipeline: intensity standardisation and final
//! conversion.

use serde::{Deserialize, Serialize};

use crate::error::{AugmentError, Result};
use crate::sample::Sample;

/// Per-channel zero mean / unit variance using the image's own statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Normalize {
    /// Channels with std below this become all zeros.
    pub eps: f32,
}

impl Default for Normalize {
    fn default() -> Self {
        Self { eps: 1e-8 }
    }
}

impl Normalize {
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.eps.is_finite() || self.eps < 0.0 {
            return Err(AugmentError::invalid_config(format!(
                "normalize eps must be finite and >= 0, got {}",
                self.eps
            )));
        }
        Ok(())
    }

    pub(crate) fn apply(&self, mut sample: Sample) -> Sample {
        for c in 0..sample.image.channels() {
            let (mean, std) = sample.image.channel_stats(c);
            let channel = sample.image.channel_mut(c);
            if std <= self.eps {
                channel.fill(0.0);
            } else {
                channel.iter_mut().for_each(|v| *v = (*v - mean) / std);
            }
        }
        sample
    }
}

/// Binarise mask channels to exactly {0, 1} and reject non-finite weights.
pub(crate) fn to_tensor(mut sample: Sample) -> Result<Sample> {
    sample
        .mask
        .map_inplace(|v| *v = f32::from(u8::from(*v > 0.5)));
    if let Some(weights) = &sample.weight_map {
        if weights.data().iter().any(|v| !v.is_finite()) {
            return Err(AugmentError::invalid_config(
                "weight map contains non-finite values",
            ));
        }
    }
    Ok(sample)
}
