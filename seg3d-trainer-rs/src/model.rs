//! Segmentation network interface and a compact reference network.
//!
//! The trainer treats the network as a black box behind
//! [`SegmentationModel`]: a forward pass plus a named parameter set held in a
//! candle [`VarMap`]. Which parameters receive gradients is decided by the
//! [`GradientFlow`] passed to each forward call, so freezing never mutates
//! shared model state.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{Result, TrainError};

/// Whether stochastic layers are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Dropout enabled.
    Train,
    /// Deterministic inference.
    Eval,
}

/// Decides which parameters are exposed to autograd in a forward pass.
///
/// Frozen parameters enter the graph detached, so backward never computes a
/// gradient for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradientFlow {
    frozen: HashSet<String>,
    detach_all: bool,
}

impl GradientFlow {
    /// Every parameter receives gradients.
    #[must_use]
    pub fn all_trainable() -> Self {
        Self::default()
    }

    /// No parameter receives gradients.
    #[must_use]
    pub fn inference() -> Self {
        Self {
            frozen: HashSet::new(),
            detach_all: true,
        }
    }

    /// Freeze exactly the named parameters.
    #[must_use]
    pub fn with_frozen<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frozen: names.into_iter().map(Into::into).collect(),
            detach_all: false,
        }
    }

    /// Whether `name` is cut off from autograd.
    #[must_use]
    pub fn is_frozen(&self, name: &str) -> bool {
        self.detach_all || self.frozen.contains(name)
    }

    /// Tensor view of a parameter for use in a forward pass.
    #[must_use]
    pub fn expose(&self, name: &str, var: &Var) -> Tensor {
        if self.is_frozen(name) {
            var.as_tensor().detach()
        } else {
            var.as_tensor().clone()
        }
    }
}

/// Outcome of loading weights into an existing model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters overwritten from the file.
    pub loaded: Vec<String>,
    /// Parameters present in the file with a different shape.
    pub shape_mismatch: Vec<String>,
    /// Model parameters absent from the file.
    pub missing: Vec<String>,
    /// File tensors with no matching parameter.
    pub unexpected: Vec<String>,
}

/// A 3D segmentation network: `[B, C_in, D, H, W]` in, per-class
/// probabilities `[B, C_out, D, H, W]` out.
pub trait SegmentationModel: Send + Sync {
    /// Run the network.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch or tensor failure.
    fn forward(&self, input: &Tensor, mode: Mode, flow: &GradientFlow) -> Result<Tensor>;

    /// Backing parameter store.
    fn var_map(&self) -> &VarMap;

    /// Device holding the parameters.
    fn device(&self) -> &Device;

    /// Expected input channels.
    fn in_channels(&self) -> usize;

    /// Produced output channels.
    fn out_channels(&self) -> usize;

    /// Independent copy with identical weights on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be moved.
    fn replicate(&self, device: &Device) -> Result<Box<dyn SegmentationModel>>;

    /// Replace the output head with a freshly initialised one.
    ///
    /// # Errors
    ///
    /// Returns an error if the new parameters cannot be created.
    fn reset_head(&mut self, out_channels: usize) -> Result<()>;

    /// All parameters sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter store is poisoned.
    fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let vars = lock_vars(self.var_map())?;
        let mut named: Vec<(String, Var)> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    /// Total number of scalar parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter store is poisoned.
    fn parameter_count(&self) -> Result<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, v)| v.elem_count())
            .sum())
    }

    /// Write every parameter to a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn save(&self, path: &Path) -> Result<()> {
        self.var_map().save(path)?;
        Ok(())
    }

    /// Overwrite parameters from a safetensors file.
    ///
    /// Tensors whose shape differs from the parameter (such as a replaced
    /// head) and tensors with unknown names are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    fn load_weights(&self, path: &Path) -> Result<LoadReport> {
        let tensors = candle_core::safetensors::load(path, self.device())?;
        let mut report = LoadReport::default();
        for (name, var) in self.named_parameters()? {
            match tensors.get(&name) {
                Some(t) if t.dims() == var.dims() => {
                    var.set(&t.to_dtype(var.dtype())?)?;
                    report.loaded.push(name);
                }
                Some(t) => {
                    tracing::warn!(
                        "Skipping {}: file shape {:?}, model shape {:?}",
                        name,
                        t.dims(),
                        var.dims()
                    );
                    report.shape_mismatch.push(name);
                }
                None => report.missing.push(name),
            }
        }
        let known: HashSet<String> = self
            .named_parameters()?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        report.unexpected = tensors
            .keys()
            .filter(|name| !known.contains(*name))
            .cloned()
            .collect();
        report.unexpected.sort();
        if !report.unexpected.is_empty() {
            tracing::warn!("Ignoring unknown tensors: {:?}", report.unexpected);
        }
        tracing::info!(
            "Loaded {} parameters from {} ({} missing, {} mismatched)",
            report.loaded.len(),
            path.display(),
            report.missing.len(),
            report.shape_mismatch.len()
        );
        Ok(report)
    }
}

pub(crate) fn lock_vars(map: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    map.data()
        .lock()
        .map_err(|_| TrainError::Model("parameter store lock poisoned".into()))
}

/// Compact encoder/decoder network built from pointwise 3D convolutions.
///
/// Each block is a 1x1x1 convolution over channels. The encoder mixes in a
/// global-context vector (the per-sample mean of its first feature map), the
/// decoder adds a skip connection from the first encoder block, and the
/// `final_conv` head ends in a sigmoid. Parameters are named
/// `encoder.*`, `decoder.*` and `final_conv.*`.
pub struct UNet3dLite {
    config: ModelConfig,
    var_map: VarMap,
    device: Device,
    seed: u64,
}

impl UNet3dLite {
    /// Build a network with weights drawn from a seeded RNG.
    ///
    /// Weights use the uniform `±1/sqrt(fan_in)` scheme of convolution layers.
    ///
    /// # Errors
    ///
    /// Returns an error for zero-sized channel counts or tensor failures.
    pub fn new(config: &ModelConfig, device: &Device, seed: u64) -> Result<Self> {
        if config.in_channels == 0 || config.out_channels == 0 || config.features == 0 {
            return Err(TrainError::Model(format!(
                "channel counts must be > 0, got in={} out={} features={}",
                config.in_channels, config.out_channels, config.features
            )));
        }
        let model = Self {
            config: config.clone(),
            var_map: VarMap::new(),
            device: device.clone(),
            seed,
        };
        let (f, c_in, c_out) = (config.features, config.in_channels, config.out_channels);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        model.insert_layer(&mut rng, "encoder.conv1", f, c_in, true)?;
        model.insert_layer(&mut rng, "encoder.conv2", f, f, true)?;
        model.insert_layer(&mut rng, "encoder.context", f, f, false)?;
        model.insert_layer(&mut rng, "decoder.conv1", f, f, true)?;
        model.insert_layer(&mut rng, "decoder.skip", f, f, false)?;
        model.insert_layer(&mut rng, "final_conv", c_out, f, true)?;
        Ok(model)
    }

    /// Model settings.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[allow(clippy::cast_precision_loss)]
    fn insert_layer(
        &self,
        rng: &mut ChaCha8Rng,
        prefix: &str,
        out_features: usize,
        in_features: usize,
        bias: bool,
    ) -> Result<()> {
        let bound = 1.0 / (in_features as f32).sqrt();
        let mut uniform = |n: usize| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
        };
        let weight = Tensor::from_vec(
            uniform(out_features * in_features),
            (out_features, in_features),
            &self.device,
        )?;
        let mut vars = lock_vars(&self.var_map)?;
        vars.insert(format!("{prefix}.weight"), Var::from_tensor(&weight)?);
        if bias {
            let b = Tensor::from_vec(uniform(out_features), out_features, &self.device)?;
            vars.insert(format!("{prefix}.bias"), Var::from_tensor(&b)?);
        }
        Ok(())
    }

    fn linear(&self, flow: &GradientFlow, prefix: &str, bias: bool) -> Result<Linear> {
        let vars = lock_vars(&self.var_map)?;
        let get = |name: String| -> Result<Tensor> {
            let var = vars
                .get(&name)
                .ok_or_else(|| TrainError::Model(format!("missing parameter {name}")))?;
            Ok(flow.expose(&name, var))
        };
        let weight = get(format!("{prefix}.weight"))?;
        let bias = if bias {
            Some(get(format!("{prefix}.bias"))?)
        } else {
            None
        };
        Ok(Linear::new(weight, bias))
    }
}

impl SegmentationModel for UNet3dLite {
    fn forward(&self, input: &Tensor, mode: Mode, flow: &GradientFlow) -> Result<Tensor> {
        let (b, c, d, h, w) = input.dims5()?;
        if c != self.config.in_channels {
            return Err(TrainError::Model(format!(
                "expected {} input channels, got {c}",
                self.config.in_channels
            )));
        }
        let n = d * h * w;
        let f = self.config.features;

        // voxels become rows: [B * N, C]
        let x = input
            .to_dtype(DType::F32)?
            .permute((0, 2, 3, 4, 1))?
            .contiguous()?
            .reshape((b * n, c))?;

        let h1 = self.linear(flow, "encoder.conv1", true)?.forward(&x)?.relu()?;
        let context = h1
            .reshape((b, n, f))?
            .mean_keepdim(1)?
            .broadcast_as((b, n, f))?
            .contiguous()?
            .reshape((b * n, f))?;
        let h2 = self
            .linear(flow, "encoder.conv2", true)?
            .forward(&h1)?
            .add(&self.linear(flow, "encoder.context", false)?.forward(&context)?)?
            .relu()?;

        let mut up = self
            .linear(flow, "decoder.conv1", true)?
            .forward(&h2)?
            .add(&self.linear(flow, "decoder.skip", false)?.forward(&h1)?)?
            .relu()?;
        if mode == Mode::Train && self.config.dropout > 0.0 {
            up = candle_nn::ops::dropout(&up, self.config.dropout)?;
        }

        let logits = self.linear(flow, "final_conv", true)?.forward(&up)?;
        let probs = logits.neg()?.exp()?.affine(1.0, 1.0)?.recip()?;
        let c_out = self.config.out_channels;
        Ok(probs
            .reshape((b, d, h, w, c_out))?
            .permute((0, 4, 1, 2, 3))?
            .contiguous()?)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    fn out_channels(&self) -> usize {
        self.config.out_channels
    }

    fn replicate(&self, device: &Device) -> Result<Box<dyn SegmentationModel>> {
        let copy = UNet3dLite {
            config: self.config.clone(),
            var_map: VarMap::new(),
            device: device.clone(),
            seed: self.seed,
        };
        {
            let mut dst = lock_vars(&copy.var_map)?;
            for (name, var) in self.named_parameters()? {
                let tensor = var.as_tensor().to_device(device)?.copy()?;
                dst.insert(name, Var::from_tensor(&tensor)?);
            }
        }
        Ok(Box::new(copy))
    }

    fn reset_head(&mut self, out_channels: usize) -> Result<()> {
        if out_channels == 0 {
            return Err(TrainError::Model("head needs at least one channel".into()));
        }
        {
            let mut vars = lock_vars(&self.var_map)?;
            vars.remove("final_conv.weight");
            vars.remove("final_conv.bias");
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(1);
        self.insert_layer(&mut rng, "final_conv", out_channels, self.config.features, true)?;
        tracing::info!(
            "Replaced final_conv head: {} -> {} channels",
            self.config.out_channels,
            out_channels
        );
        self.config.out_channels = out_channels;
        Ok(())
    }
}

/// Build the network named in the config and load pretrained weights if any.
///
/// # Errors
///
/// Returns an error if the network cannot be built or weights cannot be read.
pub fn build_model(
    config: &ModelConfig,
    device: &Device,
    seed: u64,
) -> Result<Box<dyn SegmentationModel>> {
    let mut model = UNet3dLite::new(config, device, seed)?;
    if let Some(path) = &config.pretrained {
        let report = model.load_weights(path)?;
        if let Some(head) = config.head_channels {
            model.reset_head(head)?;
        } else if !report.shape_mismatch.is_empty() {
            tracing::warn!(
                "Pretrained weights left {} parameters at initial values",
                report.shape_mismatch.len()
            );
        }
    } else if let Some(head) = config.head_channels {
        model.reset_head(head)?;
    }
    tracing::info!(
        "Built UNet3dLite: in={}, out={}, features={}, {} parameters",
        model.in_channels(),
        model.out_channels(),
        config.features,
        model.parameter_count()?
    );
    Ok(Box::new(model))
}
