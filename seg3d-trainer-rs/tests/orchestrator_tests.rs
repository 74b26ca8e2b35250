//! End-to-end runs of the training orchestrator on small synthetic volumes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::Device;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;
use voxel_augment_rs::{Sample, Volume};

use seg3d_trainer_rs::checkpoint::{read_state, CheckpointKind};
use seg3d_trainer_rs::orchestrator::build_datasets;
use seg3d_trainer_rs::{
    build_model, SyntheticDataset, DevicePlan, FinetuneConfig, OrchestratorState, Phase, TrainError,
    TrainingOrchestrator, VolumeDataset,
};

fn smoke_config(dir: &TempDir) -> FinetuneConfig {
    let mut config = FinetuneConfig::smoke_test_preset();
    config.output_dir = dir.path().join("run");
    config
}

/// Masks carry a NaN so the loss of every batch is non-finite.
struct PoisonedDataset;

impl VolumeDataset for PoisonedDataset {
    fn len(&self) -> usize {
        4
    }

    fn load(&self, _index: usize, _rng: &mut ChaCha8Rng) -> seg3d_trainer_rs::Result<Sample> {
        let image = Volume::new([1, 4, 4, 4], vec![0.5; 64])?;
        let mut mask = vec![0.0; 3 * 64];
        mask[0] = f32::NAN;
        let mask = Volume::new([3, 4, 4, 4], mask)?;
        Ok(Sample::new(image, mask, None)?)
    }
}

/// Raises the interrupt flag once `after` samples have been loaded.
struct InterruptingDataset {
    inner: SyntheticDataset,
    loads: Arc<AtomicUsize>,
    after: usize,
    flag: Arc<AtomicBool>,
}

impl VolumeDataset for InterruptingDataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> seg3d_trainer_rs::Result<Sample> {
        if self.loads.fetch_add(1, Ordering::SeqCst) + 1 > self.after {
            self.flag.store(true, Ordering::SeqCst);
        }
        self.inner.load(index, rng)
    }
}

#[test]
fn test_smoke_run_completes_and_saves_best() {
    let dir = TempDir::new().unwrap();
    let config = smoke_config(&dir);
    let output_dir = config.output_dir.clone();

    let mut orchestrator = TrainingOrchestrator::new(config).unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    let summary = orchestrator.fit().unwrap();

    assert_eq!(summary.epochs_run, 2);
    assert_eq!(orchestrator.state(), OrchestratorState::Done);
    let records = summary.history.records();
    assert_eq!(records.len(), 2);
    for record in records {
        assert_eq!(record.train_samples, 6);
        assert_eq!(record.val_samples, 2);
        assert!(record.train_loss.is_finite());
        assert!(record.val_loss.is_finite());
    }
    // the first epoch always improves on "no best yet"
    assert!(records[0].checkpoint_saved);
    assert!(summary.best_metric.is_some());

    assert!(output_dir.join("best").join("model.safetensors").is_file());
    assert!(output_dir.join("metrics.csv").is_file());
    assert!(output_dir.join("config.yaml").is_file());
    assert!(!output_dir.join("last").exists());
}

#[test]
fn test_best_checkpoint_reproduces_val_loss() {
    let dir = TempDir::new().unwrap();
    let config = smoke_config(&dir);
    let best_dir = config.output_dir.join("best");

    let summary = TrainingOrchestrator::new(config.clone())
        .unwrap()
        .fit()
        .unwrap();
    let best = summary.best_metric.unwrap();

    let mut fresh = TrainingOrchestrator::new(config).unwrap();
    fresh.load_weights(&best_dir).unwrap();
    let metrics = fresh.evaluate().unwrap();

    assert_eq!(metrics.phase, Phase::Val);
    assert_eq!(metrics.sample_count, 2);
    assert!(
        (metrics.mean_loss - best).abs() < 1e-5,
        "reloaded {} vs recorded {best}",
        metrics.mean_loss
    );
}

#[test]
fn test_non_finite_loss_names_the_batch() {
    let dir = TempDir::new().unwrap();
    let config = smoke_config(&dir);
    let output_dir = config.output_dir.clone();
    let model = build_model(&config.model, &Device::Cpu, config.seed).unwrap();
    let poisoned: Arc<dyn VolumeDataset> = Arc::new(PoisonedDataset);

    let mut orchestrator = TrainingOrchestrator::from_parts(
        config,
        model,
        &DevicePlan::cpu(),
        Arc::clone(&poisoned),
        poisoned,
    )
    .unwrap();
    let before: Vec<f32> = orchestrator
        .partition()
        .trainable()
        .iter()
        .flat_map(|(_, var)| var.flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect();

    let err = orchestrator.fit().unwrap_err();
    match &err {
        TrainError::BatchFailed {
            epoch,
            phase,
            batch,
            ..
        } => {
            assert_eq!(*epoch, 0);
            assert_eq!(*phase, Phase::Train);
            assert_eq!(*batch, 0);
        }
        other => panic!("expected BatchFailed, got {other}"),
    }
    assert!(matches!(err.root_cause(), TrainError::NonFiniteLoss { .. }));

    let after: Vec<f32> = orchestrator
        .partition()
        .trainable()
        .iter()
        .flat_map(|(_, var)| var.flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect();
    assert_eq!(before, after);
    assert_eq!(orchestrator.optimizer().step_count(), 0);
    assert!(!output_dir.join("best").exists());
}

#[test]
fn test_interrupt_writes_last_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = smoke_config(&dir);
    let flag = Arc::new(AtomicBool::new(false));

    let mut orchestrator = TrainingOrchestrator::new(config)
        .unwrap()
        .with_interrupt(Arc::clone(&flag));
    flag.store(true, Ordering::SeqCst);

    let err = orchestrator.fit().unwrap_err();
    assert!(matches!(err, TrainError::Interrupted { epoch: 0 }));

    let last = orchestrator.checkpoints().path(CheckpointKind::Last);
    assert!(last.join("model.safetensors").is_file());
    let state = read_state(&last).unwrap();
    assert_eq!(state.epoch, 0);
    assert_eq!(state.completed_epochs, 0);
    assert!(state.best_metric.is_none());
}

#[test]
fn test_resume_continues_after_completed_epochs() {
    let dir = TempDir::new().unwrap();
    let mut config = smoke_config(&dir);
    config.training.epochs = 1;
    let first = TrainingOrchestrator::new(config.clone())
        .unwrap()
        .fit()
        .unwrap();
    assert_eq!(first.epochs_run, 1);

    config.training.epochs = 3;
    let mut resumed = TrainingOrchestrator::new(config.clone()).unwrap();
    resumed
        .resume_from(&config.output_dir.join("best"))
        .unwrap();
    assert_eq!(resumed.start_epoch(), 1);
    assert!(resumed.optimizer().step_count() > 0);

    let summary = resumed.fit().unwrap();
    assert_eq!(summary.epochs_run, 2);
    let epochs: Vec<usize> = summary.history.records().iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![0, 1, 2]);
}

#[test]
fn test_two_replicas_match_single_device() {
    let dir = TempDir::new().unwrap();
    let mut config = smoke_config(&dir);
    config.training.epochs = 1;
    config.training.batch_size = 3;

    let run = |plan: DevicePlan, name: &str| {
        let mut config = config.clone();
        config.output_dir = dir.path().join(name);
        let model = build_model(&config.model, plan.primary(), config.seed).unwrap();
        let (train, val) = build_datasets(&config).unwrap();
        let mut orchestrator =
            TrainingOrchestrator::from_parts(config, model, &plan, train, val).unwrap();
        assert_eq!(orchestrator.model().device_count(), plan.devices().len());
        orchestrator.fit().unwrap()
    };

    let single = run(DevicePlan::cpu(), "single");
    let parallel = run(
        DevicePlan::from_devices(vec![Device::Cpu, Device::Cpu]).unwrap(),
        "parallel",
    );

    let a = &single.history.records()[0];
    let b = &parallel.history.records()[0];
    assert_eq!(a.train_samples, b.train_samples);
    assert!((a.train_loss - b.train_loss).abs() < 1e-4);
    assert!((a.val_loss - b.val_loss).abs() < 1e-4);
}

#[test]
fn test_interrupt_mid_epoch_keeps_best_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = smoke_config(&dir);
    let synthetic = &config.data.synthetic_data;
    let (train, val) = SyntheticDataset::pair(synthetic, config.seed).unwrap();
    let flag = Arc::new(AtomicBool::new(false));
    let loads = Arc::new(AtomicUsize::new(0));
    // a full epoch plus the first batch of epoch 1; loading the second batch
    // raises the flag
    let after = synthetic.train_size + synthetic.val_size + config.training.batch_size;
    let wrap = |inner: SyntheticDataset| -> Arc<dyn VolumeDataset> {
        Arc::new(InterruptingDataset {
            inner,
            loads: Arc::clone(&loads),
            after,
            flag: Arc::clone(&flag),
        })
    };

    let model = build_model(&config.model, &Device::Cpu, config.seed).unwrap();
    let mut orchestrator =
        TrainingOrchestrator::from_parts(config, model, &DevicePlan::cpu(), wrap(train), wrap(val))
            .unwrap()
            .with_interrupt(Arc::clone(&flag));

    let err = orchestrator.fit().unwrap_err();
    assert!(matches!(err, TrainError::Interrupted { epoch: 1 }));

    let best = read_state(&orchestrator.checkpoints().path(CheckpointKind::Best)).unwrap();
    assert_eq!(best.epoch, 0);
    assert_eq!(best.completed_epochs, 1);

    // last/ was taken after the first batch of epoch 1 had been applied
    let last = read_state(&orchestrator.checkpoints().path(CheckpointKind::Last)).unwrap();
    assert_eq!(last.epoch, 1);
    assert_eq!(last.completed_epochs, 1);
    assert_eq!(last.best_metric, best.best_metric);
    assert!(last.optimizer_step > best.optimizer_step);
}
