//! Adam with L2 weight decay over the trainable partition.

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};
use crate::selector::ParameterPartition;

/// Gradients keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct GradientSet {
    grads: BTreeMap<String, Tensor>,
}

impl GradientSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull the gradients of `params` out of a backward pass.
    ///
    /// Parameters that did not take part in the graph are skipped.
    #[must_use]
    pub fn from_backward(store: &GradStore, params: &[(String, Var)]) -> Self {
        let grads = params
            .iter()
            .filter_map(|(name, var)| {
                store
                    .get(var.as_tensor())
                    .map(|g| (name.clone(), g.clone()))
            })
            .collect();
        Self { grads }
    }

    /// Gradient of one parameter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    /// Insert or replace a gradient.
    pub fn insert(&mut self, name: impl Into<String>, grad: Tensor) {
        self.grads.insert(name.into(), grad);
    }

    /// Number of gradients held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    /// Whether no gradient is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.grads.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Add `weight * other` into this set, moving tensors to `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a transfer or shape-mismatched add fails.
    pub fn accumulate_scaled(
        &mut self,
        other: &GradientSet,
        weight: f64,
        device: &Device,
    ) -> Result<()> {
        for (name, grad) in &other.grads {
            let scaled = grad.to_device(device)?.affine(weight, 0.0)?;
            let merged = match self.grads.remove(name) {
                Some(existing) => existing.add(&scaled)?,
                None => scaled,
            };
            self.grads.insert(name.clone(), merged);
        }
        Ok(())
    }
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    /// Step size.
    pub lr: f64,
    /// First moment decay.
    pub beta1: f64,
    /// Second moment decay.
    pub beta2: f64,
    /// Denominator epsilon.
    pub eps: f64,
    /// L2 penalty added to the gradient.
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-5,
        }
    }
}

impl From<&TrainingConfig> for AdamParams {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            lr: config.learning_rate,
            beta1: config.betas.0,
            beta2: config.betas.1,
            eps: config.eps,
            weight_decay: config.weight_decay,
        }
    }
}

/// Adam over a fixed parameter list.
///
/// Weight decay is the classic L2 form: `g <- g + wd * theta` before the
/// moment updates. Parameters without a gradient in a step are left alone.
pub struct Adam {
    params: AdamParams,
    vars: Vec<(String, Var)>,
    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,
    t: usize,
}

impl Adam {
    /// Optimizer over the partition's trainable parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the moment buffers cannot be allocated.
    pub fn new(partition: &ParameterPartition, params: AdamParams) -> Result<Self> {
        Self::from_vars(partition.trainable().to_vec(), params)
    }

    /// Optimizer over an explicit parameter list.
    ///
    /// # Errors
    ///
    /// Returns an error if the moment buffers cannot be allocated.
    pub fn from_vars(vars: Vec<(String, Var)>, params: AdamParams) -> Result<Self> {
        let mut m = HashMap::with_capacity(vars.len());
        let mut v = HashMap::with_capacity(vars.len());
        for (name, var) in &vars {
            m.insert(name.clone(), Tensor::zeros(var.dims(), DType::F32, var.device())?);
            v.insert(name.clone(), Tensor::zeros(var.dims(), DType::F32, var.device())?);
        }
        Ok(Self {
            params,
            vars,
            m,
            v,
            t: 0,
        })
    }

    /// Apply one update.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch or tensor failure.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn step(&mut self, grads: &GradientSet) -> Result<()> {
        self.t += 1;
        let p = self.params;
        let bc1 = 1.0 - p.beta1.powi(self.t as i32);
        let bc2 = 1.0 - p.beta2.powi(self.t as i32);

        for (name, var) in &self.vars {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let theta = var.as_tensor();
            let mut grad = grad.to_device(var.device())?;
            if p.weight_decay != 0.0 {
                grad = grad.add(&theta.affine(p.weight_decay, 0.0)?)?;
            }

            let m = self.m.get(name).ok_or_else(|| missing_state(name))?;
            let v = self.v.get(name).ok_or_else(|| missing_state(name))?;

            // m = b1 * m + (1 - b1) * g ; v = b2 * v + (1 - b2) * g^2
            let m_new = m.affine(p.beta1, 0.0)?.add(&grad.affine(1.0 - p.beta1, 0.0)?)?;
            let v_new = v
                .affine(p.beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - p.beta2, 0.0)?)?;

            let m_hat = m_new.affine(1.0 / bc1, 0.0)?;
            let denom = v_new.affine(1.0 / bc2, 0.0)?.sqrt()?.affine(1.0, p.eps)?;
            let update = m_hat.div(&denom)?.affine(p.lr, 0.0)?;
            var.set(&theta.sub(&update)?)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }
        Ok(())
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    /// Number of steps taken.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.t
    }

    /// Names of the optimised parameters.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(name, _)| name.as_str())
    }

    /// Moment buffers keyed `m.<name>` / `v.<name>`.
    #[must_use]
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::with_capacity(self.m.len() * 2);
        for (name, t) in &self.m {
            out.insert(format!("m.{name}"), t.clone());
        }
        for (name, t) in &self.v {
            out.insert(format!("v.{name}"), t.clone());
        }
        out
    }

    /// Restore moment buffers and the step counter.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Checkpoint`] if a buffer is missing or has the
    /// wrong shape.
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>, step: usize) -> Result<()> {
        for (name, var) in &self.vars {
            for (prefix, store) in [("m", &mut self.m), ("v", &mut self.v)] {
                let key = format!("{prefix}.{name}");
                let tensor = tensors
                    .get(&key)
                    .ok_or_else(|| TrainError::Checkpoint(format!("optimizer state lacks {key}")))?;
                if tensor.dims() != var.dims() {
                    return Err(TrainError::Checkpoint(format!(
                        "optimizer state {key} has shape {:?}, parameter has {:?}",
                        tensor.dims(),
                        var.dims()
                    )));
                }
                store.insert(
                    name.clone(),
                    tensor.to_dtype(DType::F32)?.to_device(var.device())?,
                );
            }
        }
        self.t = step;
        Ok(())
    }
}

fn missing_state(name: &str) -> TrainError {
    TrainError::Training(format!("no optimizer state for {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let w = var(&[1.0, -2.0]);
        let params = AdamParams {
            lr: 0.1,
            weight_decay: 0.0,
            ..AdamParams::default()
        };
        let mut adam = Adam::from_vars(vec![("w".into(), w.clone())], params).unwrap();
        let mut grads = GradientSet::new();
        grads.insert("w", Tensor::new(&[0.5f32, -3.0], &Device::Cpu).unwrap());
        adam.step(&grads).unwrap();
        // bias-corrected first step is lr * sign(g)
        let got = values(&w);
        assert!((got[0] - 0.9).abs() < 1e-5);
        assert!((got[1] + 1.9).abs() < 1e-5);
        assert_eq!(adam.step_count(), 1);
    }

    #[test]
    fn test_minimises_quadratic() {
        let w = var(&[3.0]);
        let params = AdamParams {
            lr: 0.1,
            ..AdamParams::default()
        };
        let mut adam = Adam::from_vars(vec![("w".into(), w.clone())], params).unwrap();
        for _ in 0..200 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            let store = loss.backward().unwrap();
            let grads = GradientSet::from_backward(&store, &[("w".into(), w.clone())]);
            adam.step(&grads).unwrap();
        }
        assert!(values(&w)[0].abs() < 0.1);
    }

    #[test]
    fn test_missing_gradient_leaves_parameter() {
        let w = var(&[1.0]);
        let mut adam =
            Adam::from_vars(vec![("w".into(), w.clone())], AdamParams::default()).unwrap();
        adam.step(&GradientSet::new()).unwrap();
        assert_eq!(values(&w), vec![1.0]);
    }

    #[test]
    fn test_state_roundtrip() {
        let w = var(&[1.0, 2.0]);
        let mut adam =
            Adam::from_vars(vec![("w".into(), w.clone())], AdamParams::default()).unwrap();
        let mut grads = GradientSet::new();
        grads.insert("w", Tensor::new(&[1.0f32, 1.0], &Device::Cpu).unwrap());
        adam.step(&grads).unwrap();
        let state = adam.state_tensors();
        assert!(state.contains_key("m.w"));
        assert!(state.contains_key("v.w"));

        let mut restored =
            Adam::from_vars(vec![("w".into(), var(&[0.0, 0.0]))], AdamParams::default()).unwrap();
        restored.load_state(&state, adam.step_count()).unwrap();
        assert_eq!(restored.step_count(), 1);
        let m: Vec<f32> = restored.state_tensors()["m.w"].to_vec1().unwrap();
        assert!((m[0] - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_load_state_rejects_missing_key() {
        let mut adam =
            Adam::from_vars(vec![("w".into(), var(&[1.0]))], AdamParams::default()).unwrap();
        let err = adam.load_state(&HashMap::new(), 3).unwrap_err();
        assert!(matches!(err, TrainError::Checkpoint(_)));
    }

    #[test]
    fn test_accumulate_scaled() {
        let mut total = GradientSet::new();
        let mut a = GradientSet::new();
        a.insert("w", Tensor::new(&[2.0f32], &Device::Cpu).unwrap());
        let mut b = GradientSet::new();
        b.insert("w", Tensor::new(&[4.0f32], &Device::Cpu).unwrap());
        total.accumulate_scaled(&a, 0.75, &Device::Cpu).unwrap();
        total.accumulate_scaled(&b, 0.25, &Device::Cpu).unwrap();
        let got: Vec<f32> = total.get("w").unwrap().to_vec1().unwrap();
        assert!((got[0] - 2.5).abs() < 1e-6);
    }
}
