//! Learning rate scheduling driven by the validation loss.

use serde::{Deserialize, Serialize};

use crate::config::PlateauConfig;
use crate::optimizer::Adam;

/// Reduce the learning rate when a minimised metric stops improving.
///
/// An epoch improves on the best metric when `metric < best * (1 - threshold)`.
/// Once more than `patience` epochs pass without improvement the rate is
/// multiplied by `factor`, floored at `min_lr`, and `cooldown` epochs are
/// ignored before bad epochs count again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    threshold: f64,
    cooldown: usize,
    min_lr: f64,
    best: Option<f64>,
    num_bad_epochs: usize,
    cooldown_counter: usize,
    reductions: usize,
}

impl ReduceLrOnPlateau {
    /// Scheduler with the given settings and no history.
    #[must_use]
    pub fn new(config: &PlateauConfig) -> Self {
        Self {
            factor: config.factor,
            patience: config.patience,
            threshold: config.threshold,
            cooldown: config.cooldown,
            min_lr: config.min_lr,
            best: None,
            num_bad_epochs: 0,
            cooldown_counter: 0,
            reductions: 0,
        }
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.threshold),
        }
    }

    /// Feed one epoch's metric; returns the new rate if it was reduced.
    pub fn step(&mut self, metric: f64, optimizer: &mut Adam) -> Option<f64> {
        if self.is_better(metric) {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs <= self.patience {
            return None;
        }

        self.cooldown_counter = self.cooldown;
        self.num_bad_epochs = 0;
        let old_lr = optimizer.learning_rate();
        let new_lr = (old_lr * self.factor).max(self.min_lr);
        if old_lr - new_lr <= f64::EPSILON * old_lr.abs() {
            return None;
        }
        optimizer.set_learning_rate(new_lr);
        self.reductions += 1;
        tracing::info!("Reducing learning rate: {old_lr:.3e} -> {new_lr:.3e}");
        Some(new_lr)
    }

    /// Best metric seen so far.
    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Consecutive epochs without improvement.
    #[must_use]
    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    /// How many times the rate was lowered.
    #[must_use]
    pub fn reductions(&self) -> usize {
        self.reductions
    }
}
