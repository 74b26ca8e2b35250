//! Device detection and single / multi-device execution.
//!
//! [`DeviceDispatcher`] decides where the model runs. [`DispatchedModel`]
//! hides whether a batch is processed on one device or split across several
//! replicas; both variants return the same [`StepOutput`].

use std::collections::HashMap;
use std::thread;

use candle_core::{Device, Tensor, Var};

use crate::config::ModelConfig;
use crate::error::{Result, TrainError};
use crate::loader::Batch;
use crate::loss::WeightedLoss;
use crate::model::{GradientFlow, Mode, SegmentationModel};
use crate::optimizer::GradientSet;
use crate::selector::ParameterPartition;

/// Environment variable that disables accelerator detection when set to `1`.
pub const FORCE_CPU_ENV: &str = "SEG3D_FORCE_CPU";

/// Devices selected for a run; the first one holds the master weights.
#[derive(Debug, Clone)]
pub struct DevicePlan {
    devices: Vec<Device>,
}

impl DevicePlan {
    /// CPU only.
    #[must_use]
    pub fn cpu() -> Self {
        Self {
            devices: vec![Device::Cpu],
        }
    }

    /// Explicit device list.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] for an empty list.
    pub fn from_devices(devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            return Err(TrainError::Config("device plan needs at least one device".into()));
        }
        Ok(Self { devices })
    }

    /// Device holding the master weights and optimizer state.
    #[must_use]
    pub fn primary(&self) -> &Device {
        &self.devices[0]
    }

    /// All devices, primary first.
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Whether batches are split across devices.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.devices.len() > 1
    }
}

/// Chooses devices and wraps the model for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDispatcher {
    max_devices: usize,
    force_cpu: bool,
}

impl DeviceDispatcher {
    /// Dispatcher probing at most `max_devices` accelerators.
    #[must_use]
    pub fn new(max_devices: usize, force_cpu: bool) -> Self {
        Self {
            max_devices,
            force_cpu,
        }
    }

    /// Dispatcher from model settings.
    #[must_use]
    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.max_devices, config.force_cpu)
    }

    fn cpu_forced(&self) -> bool {
        self.force_cpu
            || std::env::var(FORCE_CPU_ENV)
                .ok()
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }

    /// Probe accelerators in ordinal order.
    ///
    /// Probing stops at the first ordinal that fails to initialise; with no
    /// accelerator the plan falls back to the CPU.
    #[must_use]
    pub fn detect(&self) -> DevicePlan {
        if self.cpu_forced() {
            tracing::warn!("CPU mode forced via config or {FORCE_CPU_ENV}=1");
            return DevicePlan::cpu();
        }
        if !cfg!(feature = "cuda") {
            tracing::warn!("CUDA feature disabled; running on CPU. Enable with --features cuda.");
            return DevicePlan::cpu();
        }

        let mut devices = Vec::new();
        for ordinal in 0..self.max_devices {
            match Device::new_cuda(ordinal) {
                Ok(device) => devices.push(device),
                Err(err) => {
                    let unavailable = TrainError::DeviceUnavailable {
                        ordinal,
                        reason: err.to_string(),
                    };
                    if ordinal == 0 {
                        tracing::warn!("{unavailable}; falling back to CPU");
                    } else {
                        tracing::debug!("{unavailable}; stopping device probe");
                    }
                    break;
                }
            }
        }

        match devices.len() {
            0 => DevicePlan::cpu(),
            1 => {
                tracing::info!("Training device: CUDA (device 0)");
                DevicePlan { devices }
            }
            n => {
                tracing::info!("Running on {n} CUDA devices");
                DevicePlan { devices }
            }
        }
    }

    /// Place the model according to `plan`.
    ///
    /// `partition` must have been selected from `model` itself: the optimizer
    /// steps those variables, so the model is never moved or copied here.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Model`] if the model is not on the plan's primary
    /// device or `partition` holds variables of another model, or an error if
    /// replication fails.
    pub fn wrap(
        &self,
        model: Box<dyn SegmentationModel>,
        plan: &DevicePlan,
        partition: &ParameterPartition,
    ) -> Result<DispatchedModel> {
        check_partition(model.as_ref(), partition)?;
        if plan.is_parallel() {
            Ok(DispatchedModel::Parallel(DataParallel::new(
                model,
                plan.devices(),
                partition,
            )?))
        } else {
            check_primary(model.as_ref(), plan.primary())?;
            Ok(DispatchedModel::Single(model))
        }
    }
}

fn check_primary(model: &dyn SegmentationModel, primary: &Device) -> Result<()> {
    if model.device().same_device(primary) {
        Ok(())
    } else {
        Err(TrainError::Model(format!(
            "model lives on {:?} but the primary device is {primary:?}",
            model.device()
        )))
    }
}

/// Every trainable variable must be the model's own, not a copy.
fn check_partition(model: &dyn SegmentationModel, partition: &ParameterPartition) -> Result<()> {
    let own: HashMap<String, Var> = model.named_parameters()?.into_iter().collect();
    for (name, var) in partition.trainable() {
        match own.get(name) {
            Some(own_var) if own_var.id() == var.id() => {}
            _ => {
                return Err(TrainError::Model(format!(
                    "trainable parameter {name} does not belong to the wrapped model"
                )))
            }
        }
    }
    Ok(())
}

/// Result of one training step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Mean loss over the batch.
    pub loss: f64,
    /// Gradients of the trainable parameters, on the primary device.
    pub grads: GradientSet,
    /// Samples processed.
    pub samples: usize,
}

/// Model placed on one device or replicated over several.
pub enum DispatchedModel {
    /// Whole batch on one device.
    Single(Box<dyn SegmentationModel>),
    /// Batch split across replicas.
    Parallel(DataParallel),
}

impl DispatchedModel {
    /// Model holding the master weights.
    #[must_use]
    pub fn primary(&self) -> &dyn SegmentationModel {
        match self {
            DispatchedModel::Single(model) => model.as_ref(),
            DispatchedModel::Parallel(dp) => dp.primary(),
        }
    }

    /// Number of devices in use.
    #[must_use]
    pub fn device_count(&self) -> usize {
        match self {
            DispatchedModel::Single(_) => 1,
            DispatchedModel::Parallel(dp) => dp.replica_count(),
        }
    }

    /// Forward, loss and backward for one batch.
    ///
    /// A non-finite loss is reported before any backward pass runs.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::NonFiniteLoss`] or any tensor error.
    pub fn train_step(
        &self,
        batch: &Batch,
        loss: &WeightedLoss,
        partition: &ParameterPartition,
    ) -> Result<StepOutput> {
        match self {
            DispatchedModel::Single(model) => {
                let flow = partition.gradient_flow();
                let value = shard_loss(model.as_ref(), batch, loss, Mode::Train, &flow)?;
                let scalar = finite_scalar(&value)?;
                let store = value.backward()?;
                Ok(StepOutput {
                    loss: scalar,
                    grads: GradientSet::from_backward(&store, partition.trainable()),
                    samples: batch.len,
                })
            }
            DispatchedModel::Parallel(dp) => dp.train_step(batch, loss, partition),
        }
    }

    /// Loss of one batch in eval mode without gradients.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::NonFiniteLoss`] or any tensor error.
    pub fn eval_step(&self, batch: &Batch, loss: &WeightedLoss) -> Result<f64> {
        match self {
            DispatchedModel::Single(model) => {
                let value = shard_loss(
                    model.as_ref(),
                    batch,
                    loss,
                    Mode::Eval,
                    &GradientFlow::inference(),
                )?;
                finite_scalar(&value)
            }
            DispatchedModel::Parallel(dp) => dp.eval_step(batch, loss),
        }
    }

    /// Copy every primary parameter to the replicas.
    ///
    /// # Errors
    ///
    /// Returns an error if a transfer fails.
    pub fn broadcast_all(&self) -> Result<()> {
        match self {
            DispatchedModel::Single(_) => Ok(()),
            DispatchedModel::Parallel(dp) => dp.broadcast(None),
        }
    }
}

fn shard_loss(
    model: &dyn SegmentationModel,
    batch: &Batch,
    loss: &WeightedLoss,
    mode: Mode,
    flow: &GradientFlow,
) -> Result<Tensor> {
    let batch = batch.to_device(model.device())?;
    let pred = model.forward(&batch.images, mode, flow)?;
    loss.compute(&pred, &batch.masks, batch.weight_maps.as_ref())
}

fn finite_scalar(loss: &Tensor) -> Result<f64> {
    let value = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    if value.is_finite() {
        Ok(f64::from(value))
    } else {
        Err(TrainError::NonFiniteLoss { value })
    }
}

/// Data parallelism over model replicas.
///
/// The batch is cut into contiguous shards along dim 0, one per replica.
/// Forward passes run on scoped threads, all shard losses are checked for
/// finiteness, then backward passes run and the shard gradients are reduced
/// onto the primary device weighted by shard size. Because the loss is a
/// per-sample mean, the reduced gradient equals the single-device one.
pub struct DataParallel {
    replicas: Vec<Box<dyn SegmentationModel>>,
}

impl DataParallel {
    /// Replicate `model` onto each of `devices`; the first becomes primary.
    ///
    /// The same device may appear several times, which runs several replicas
    /// on it.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] for an empty device list, or an error if
    /// replication fails.
    pub fn new(
        model: Box<dyn SegmentationModel>,
        devices: &[Device],
        partition: &ParameterPartition,
    ) -> Result<Self> {
        let (first, rest) = devices
            .split_first()
            .ok_or_else(|| TrainError::Config("data parallelism needs a device".into()))?;
        check_primary(model.as_ref(), first)?;
        let mut replicas = Vec::with_capacity(devices.len());
        for device in rest {
            replicas.push(model.replicate(device)?);
        }
        replicas.insert(0, model);
        tracing::info!(
            "Data parallel over {} replicas, {} synchronised tensors",
            replicas.len(),
            partition.trainable().len()
        );
        Ok(Self { replicas })
    }

    /// Model holding the master weights.
    #[must_use]
    pub fn primary(&self) -> &dyn SegmentationModel {
        self.replicas[0].as_ref()
    }

    /// Number of replicas.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Copy primary weights onto the other replicas; `None` copies all.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter is missing on a replica or a transfer
    /// fails.
    pub fn broadcast(&self, names: Option<&[(String, Var)]>) -> Result<()> {
        let source: Vec<(String, Var)> = match names {
            Some(vars) => vars.to_vec(),
            None => self.primary().named_parameters()?,
        };
        for replica in &self.replicas[1..] {
            let targets: HashMap<String, Var> = replica.named_parameters()?.into_iter().collect();
            for (name, var) in &source {
                let target = targets.get(name).ok_or_else(|| {
                    TrainError::Model(format!("replica lacks parameter {name}"))
                })?;
                target.set(&var.as_tensor().to_device(replica.device())?)?;
            }
        }
        Ok(())
    }

    /// Contiguous shards `(start, len)` covering `batch_len`, at most one per
    /// replica.
    #[must_use]
    pub fn shards(&self, batch_len: usize) -> Vec<(usize, usize)> {
        let n = self.replicas.len().min(batch_len);
        if n == 0 {
            return Vec::new();
        }
        let (base, extra) = (batch_len / n, batch_len % n);
        let mut start = 0;
        (0..n)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let shard = (start, len);
                start += len;
                shard
            })
            .collect()
    }

    fn forward_shards(
        &self,
        batch: &Batch,
        loss: &WeightedLoss,
        mode: Mode,
        flow: &GradientFlow,
    ) -> Result<Vec<(usize, Tensor)>> {
        let shards = self.shards(batch.len);
        let results: Vec<Result<(usize, Tensor)>> = thread::scope(|scope| {
            let handles: Vec<_> = shards
                .iter()
                .zip(&self.replicas)
                .map(|(&(start, len), replica)| {
                    scope.spawn(move || -> Result<(usize, Tensor)> {
                        let shard = batch.narrow(start, len)?;
                        Ok((len, shard_loss(replica.as_ref(), &shard, loss, mode, flow)?))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(TrainError::Training("replica thread panicked".into()))
                    })
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn train_step(
        &self,
        batch: &Batch,
        loss: &WeightedLoss,
        partition: &ParameterPartition,
    ) -> Result<StepOutput> {
        self.broadcast(Some(partition.trainable()))?;
        let flow = partition.gradient_flow();
        let flow = &flow;
        let losses = self.forward_shards(batch, loss, Mode::Train, flow)?;

        #[allow(clippy::cast_precision_loss)]
        let total = batch.len as f64;
        let mut mean = 0.0;
        for (len, value) in &losses {
            #[allow(clippy::cast_precision_loss)]
            let weight = *len as f64 / total;
            mean += weight * finite_scalar(value)?;
        }

        let shard_grads: Vec<Result<(usize, GradientSet)>> = thread::scope(|scope| {
            let handles: Vec<_> = losses
                .iter()
                .zip(&self.replicas)
                .map(|((len, value), replica)| {
                    scope.spawn(move || -> Result<(usize, GradientSet)> {
                        let store = value.backward()?;
                        let params: Vec<(String, Var)> = replica
                            .named_parameters()?
                            .into_iter()
                            .filter(|(name, _)| !flow.is_frozen(name))
                            .collect();
                        Ok((*len, GradientSet::from_backward(&store, &params)))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(TrainError::Training("replica thread panicked".into()))
                    })
                })
                .collect()
        });

        let primary = self.primary().device();
        let mut grads = GradientSet::new();
        for result in shard_grads {
            let (len, shard) = result?;
            #[allow(clippy::cast_precision_loss)]
            let weight = len as f64 / total;
            grads.accumulate_scaled(&shard, weight, primary)?;
        }
        Ok(StepOutput {
            loss: mean,
            grads,
            samples: batch.len,
        })
    }

    fn eval_step(&self, batch: &Batch, loss: &WeightedLoss) -> Result<f64> {
        let losses = self.forward_shards(batch, loss, Mode::Eval, &GradientFlow::inference())?;
        #[allow(clippy::cast_precision_loss)]
        let total = batch.len as f64;
        let mut mean = 0.0;
        for (len, value) in &losses {
            #[allow(clippy::cast_precision_loss)]
            let weight = *len as f64 / total;
            mean += weight * finite_scalar(value)?;
        }
        Ok(mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::dataset::SyntheticDataset;
    use crate::loader::{DataLoader, LoaderConfig};
    use crate::model::UNet3dLite;
    use crate::selector::ParameterSelector;
    use std::sync::Arc;

    fn model() -> Box<dyn SegmentationModel> {
        let config = ModelConfig {
            out_channels: 3,
            features: 4,
            dropout: 0.0,
            head_channels: None,
            ..ModelConfig::default()
        };
        Box::new(UNet3dLite::new(&config, &Device::Cpu, 3).unwrap())
    }

    fn batch(size: usize) -> Batch {
        let dataset = SyntheticDataset::new([1, 4, 4, 4], size, 3, 1).unwrap();
        let loader = DataLoader::new(
            Arc::new(dataset),
            LoaderConfig {
                batch_size: size,
                shuffle: false,
                workers: 0,
                prefetch_factor: 1,
                seed: 0,
            },
        )
        .unwrap();
        loader.epoch(0).next().unwrap().unwrap()
    }

    #[test]
    fn test_force_cpu() {
        let plan = DeviceDispatcher::new(4, true).detect();
        assert!(!plan.is_parallel());
        assert!(plan.primary().is_cpu());
    }

    #[test]
    fn test_wrap_keeps_the_selected_variables() {
        let m = model();
        let partition = ParameterSelector::from_patterns(["decoder"]).select(m.as_ref()).unwrap();
        let wrapped = DeviceDispatcher::new(1, true)
            .wrap(m, &DevicePlan::cpu(), &partition)
            .unwrap();
        check_partition(wrapped.primary(), &partition).unwrap();
    }

    #[test]
    fn test_wrap_rejects_partition_of_another_model() {
        let selected_from = model();
        let partition = ParameterSelector::from_patterns(["decoder"])
            .select(selected_from.as_ref())
            .unwrap();
        let dispatcher = DeviceDispatcher::new(2, true);

        let single = dispatcher.wrap(model(), &DevicePlan::cpu(), &partition);
        assert!(matches!(single, Err(TrainError::Model(_))));

        let plan = DevicePlan::from_devices(vec![Device::Cpu, Device::Cpu]).unwrap();
        let parallel = dispatcher.wrap(model(), &plan, &partition);
        assert!(matches!(parallel, Err(TrainError::Model(_))));
    }

    #[test]
    fn test_shards_are_balanced() {
        let m = model();
        let partition = ParameterSelector::from_patterns(["decoder"]).select(m.as_ref()).unwrap();
        let devices = [Device::Cpu, Device::Cpu, Device::Cpu];
        let dp = DataParallel::new(m, &devices, &partition).unwrap();
        assert_eq!(dp.shards(7), vec![(0, 3), (3, 2), (5, 2)]);
        assert_eq!(dp.shards(2), vec![(0, 1), (1, 1)]);
        assert!(dp.shards(0).is_empty());
    }

    #[test]
    fn test_parallel_matches_single() {
        let loss = WeightedLoss::new(vec![1.0, 5.0, 3.0], true).unwrap();
        let b = batch(5);

        let single_model = model();
        let partition = ParameterSelector::from_patterns(["decoder", "final_conv"])
            .select(single_model.as_ref())
            .unwrap();
        let single = DispatchedModel::Single(single_model);
        let a = single.train_step(&b, &loss, &partition).unwrap();

        let parallel_model = model();
        let partition = ParameterSelector::from_patterns(["decoder", "final_conv"])
            .select(parallel_model.as_ref())
            .unwrap();
        let plan = DevicePlan::from_devices(vec![Device::Cpu, Device::Cpu]).unwrap();
        let parallel = DeviceDispatcher::new(2, false)
            .wrap(parallel_model, &plan, &partition)
            .unwrap();
        assert_eq!(parallel.device_count(), 2);
        let p = parallel.train_step(&b, &loss, &partition).unwrap();

        assert!((a.loss - p.loss).abs() < 1e-5);
        assert_eq!(a.grads.len(), p.grads.len());
        for (name, ga) in a.grads.iter() {
            let gp = p.grads.get(name).unwrap();
            let diff: f32 = ga
                .sub(gp)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(diff < 1e-5, "{name}: {diff}");
        }
        let single_loss = single.eval_step(&b, &loss).unwrap();
        let parallel_loss = parallel.eval_step(&b, &loss).unwrap();
        assert!((single_loss - parallel_loss).abs() < 1e-5);
    }

    #[test]
    fn test_frozen_parameters_have_no_gradient() {
        let m = model();
        let partition = ParameterSelector::from_patterns(["decoder"]).select(m.as_ref()).unwrap();
        let out = DispatchedModel::Single(m)
            .train_step(
                &batch(2),
                &WeightedLoss::new(vec![1.0, 1.0, 1.0], true).unwrap(),
                &partition,
            )
            .unwrap();
        let names: Vec<&str> = out.grads.iter().map(|(n, _)| n).collect();
        assert_eq!(names, partition.trainable_names().collect::<Vec<_>>());
        assert_eq!(out.samples, 2);
    }

    #[test]
    fn test_broadcast_syncs_replicas() {
        let m = model();
        let partition = ParameterSelector::from_patterns(["final_conv"])
            .select(m.as_ref())
            .unwrap();
        let dp = DataParallel::new(m, &[Device::Cpu, Device::Cpu], &partition).unwrap();
        for (_, var) in partition.trainable() {
            var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
        }
        dp.broadcast(Some(partition.trainable())).unwrap();
        let replica = dp.replicas[1].named_parameters().unwrap();
        let head = replica.iter().find(|(n, _)| n == "final_conv.weight").unwrap();
        let sum: f32 = head.1.as_tensor().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
