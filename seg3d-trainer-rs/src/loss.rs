//! Weighted binary cross-entropy plus soft-Dice.
//!
//! Predictions are probabilities of shape `[B, C, D, H, W]` (the model head
//! applies a sigmoid). Probabilities are clamped to `[eps, 1 - eps]` before
//! taking logs, so saturated predictions stay finite.
//!
//! Dice is computed per sample and then averaged over the batch. That keeps
//! the batch loss an exact size-weighted mean of shard losses, which the
//! multi-device path relies on.

use candle_core::{DType, Tensor};

use crate::config::LossConfig;
use crate::error::{Result, TrainError};

/// Probability clamp used before `ln`.
pub const PROBABILITY_EPS: f64 = 1e-7;

/// Smoothing added to numerator and denominator of the Dice ratio.
pub const DICE_SMOOTH: f64 = 1e-6;

/// Class-weighted BCE + soft-Dice.
///
/// With `per_channel = true` the loss is the **mean over channels** of
/// `w_c * (bce_c + dice_c)`. With `per_channel = false`, BCE is averaged over
/// every element with `w_c` broadcast along the channel axis, and a single
/// class-weighted Dice is taken over all channels together.
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use seg3d_trainer_rs::loss::WeightedLoss;
///
/// # fn main() -> seg3d_trainer_rs::Result<()> {
/// let loss = WeightedLoss::new(vec![1.0, 2.0], true)?;
/// let target = Tensor::zeros((1, 2, 2, 2, 2), candle_core::DType::F32, &Device::Cpu)?;
/// let value = loss.compute(&target, &target, None)?.to_scalar::<f32>()?;
/// assert!(value.is_finite());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedLoss {
    class_weights: Vec<f32>,
    per_channel: bool,
}

impl WeightedLoss {
    /// Create a loss with one weight per channel.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] for an empty or non-finite weight vector.
    pub fn new(class_weights: Vec<f32>, per_channel: bool) -> Result<Self> {
        if class_weights.is_empty() {
            return Err(TrainError::Config("class_weights must not be empty".into()));
        }
        if class_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(TrainError::Config(format!(
                "class_weights must be finite and >= 0, got {class_weights:?}"
            )));
        }
        Ok(Self {
            class_weights,
            per_channel,
        })
    }

    /// Build from the config section.
    ///
    /// # Errors
    ///
    /// See [`WeightedLoss::new`].
    pub fn from_config(config: &LossConfig) -> Result<Self> {
        Self::new(config.class_weights.clone(), config.per_channel)
    }

    /// Number of channels this loss expects.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.class_weights.len()
    }

    /// Whether channel losses are averaged separately.
    #[must_use]
    pub fn per_channel(&self) -> bool {
        self.per_channel
    }

    /// Scalar loss for a batch.
    ///
    /// `weight_map`, when given, has shape `[B, 1, D, H, W]` or matches the
    /// predictions, and multiplies the BCE terms before reduction.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] on a channel count mismatch and
    /// [`TrainError::Training`] on incompatible shapes.
    pub fn compute(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
        weight_map: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, c, n) = self.check_shapes(predictions, targets, weight_map)?;
        let device = predictions.device();

        let p = predictions
            .to_dtype(DType::F32)?
            .clamp(PROBABILITY_EPS, 1.0 - PROBABILITY_EPS)?;
        let t = targets.to_dtype(DType::F32)?;

        // -(t ln p + (1 - t) ln(1 - p))
        let pos = t.mul(&p.log()?)?;
        let neg = t.affine(-1.0, 1.0)?.mul(&p.affine(-1.0, 1.0)?.log()?)?;
        let mut bce = pos.add(&neg)?.neg()?;
        if let Some(weights) = weight_map {
            bce = bce.broadcast_mul(&weights.to_dtype(DType::F32)?)?;
        }
        let bce = bce.reshape((b, c, n))?;

        let p = p.reshape((b, c, n))?;
        let t = t.reshape((b, c, n))?;
        let intersection = p.mul(&t)?.sum(2)?;
        let cardinality = p.add(&t)?.sum(2)?;

        let class_weights = Tensor::new(self.class_weights.as_slice(), device)?;

        if self.per_channel {
            let bce_c = bce.mean(2)?.mean(0)?;
            let dice_c = soft_dice(&intersection, &cardinality)?.mean(0)?;
            Ok(bce_c.add(&dice_c)?.mul(&class_weights)?.mean(0)?)
        } else {
            let bce_all = bce
                .broadcast_mul(&class_weights.reshape((1, c, 1))?)?
                .mean_all()?;
            let w = class_weights.reshape((1, c))?;
            let intersection = intersection.broadcast_mul(&w)?.sum(1)?;
            let cardinality = cardinality.broadcast_mul(&w)?.sum(1)?;
            let dice = soft_dice(&intersection, &cardinality)?.mean(0)?;
            Ok(bce_all.add(&dice)?)
        }
    }

    fn check_shapes(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
        weight_map: Option<&Tensor>,
    ) -> Result<(usize, usize, usize)> {
        let dims = predictions.dims();
        if dims.len() != 5 {
            return Err(TrainError::Training(format!(
                "predictions must be [B, C, D, H, W], got {dims:?}"
            )));
        }
        if targets.dims() != dims {
            return Err(TrainError::Training(format!(
                "prediction shape {dims:?} does not match target shape {:?}",
                targets.dims()
            )));
        }
        let (b, c) = (dims[0], dims[1]);
        if c != self.class_weights.len() {
            return Err(TrainError::Config(format!(
                "loss has {} class weights but predictions have {c} channels",
                self.class_weights.len()
            )));
        }
        if let Some(weights) = weight_map {
            let w = weights.dims();
            let compatible = w.len() == 5
                && w[0] == b
                && (w[1] == 1 || w[1] == c)
                && w[2..] == dims[2..];
            if !compatible {
                return Err(TrainError::Training(format!(
                    "weight map shape {w:?} is not compatible with predictions {dims:?}"
                )));
            }
        }
        Ok((b, c, dims[2] * dims[3] * dims[4]))
    }
}

/// `1 - (2 I + s) / (S + s)`, elementwise.
fn soft_dice(intersection: &Tensor, cardinality: &Tensor) -> Result<Tensor> {
    let numerator = intersection.affine(2.0, DICE_SMOOTH)?;
    let denominator = cardinality.affine(1.0, DICE_SMOOTH)?;
    Ok(numerator.div(&denominator)?.affine(-1.0, 1.0)?)
}
