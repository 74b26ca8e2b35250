//! Batching with background prefetch.
//!
//! Each epoch cuts the (optionally shuffled) index order into batches.
//! Worker threads claim batch indices, load and augment the samples, collate
//! them into CPU tensors and hand them over through a bounded channel. The
//! consumer re-orders finished batches so the sequence seen by training is
//! identical for any worker count.
//!
//! Workers never run more than `workers * prefetch_factor` batches ahead of
//! the consumer, so one slow batch cannot pull the rest of the epoch into
//! memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use voxel_augment_rs::{Sample, Volume};

use crate::dataset::VolumeDataset;
use crate::error::{Result, TrainError};

/// Collated samples, `[B, C, D, H, W]` each.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Input images.
    pub images: Tensor,
    /// Target masks.
    pub masks: Tensor,
    /// Per-voxel loss weights.
    pub weight_maps: Option<Tensor>,
    /// Number of samples.
    pub len: usize,
}

impl Batch {
    /// Stack samples along a new batch axis.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Dataset`] if the batch is empty, shapes differ
    /// between samples, or only some samples carry a weight map.
    pub fn collate(samples: &[Sample]) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| TrainError::Dataset("cannot collate an empty batch".into()))?;
        let with_weights = samples.iter().filter(|s| s.weight_map.is_some()).count();
        if with_weights != 0 && with_weights != samples.len() {
            return Err(TrainError::Dataset(format!(
                "{with_weights} of {} samples carry a weight map",
                samples.len()
            )));
        }

        let images = stack(samples.iter().map(|s| &s.image), first.image.shape(), "image")?;
        let masks = stack(samples.iter().map(|s| &s.mask), first.mask.shape(), "mask")?;
        let weight_maps = if with_weights == 0 {
            None
        } else {
            let shape = first
                .weight_map
                .as_ref()
                .map(Volume::shape)
                .ok_or_else(|| TrainError::Dataset("weight map vanished".into()))?;
            Some(stack(
                samples.iter().filter_map(|s| s.weight_map.as_ref()),
                shape,
                "weight map",
            )?)
        };
        Ok(Self {
            images,
            masks,
            weight_maps,
            len: samples.len(),
        })
    }

    /// Copy every tensor to `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a transfer fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            images: self.images.to_device(device)?,
            masks: self.masks.to_device(device)?,
            weight_maps: self
                .weight_maps
                .as_ref()
                .map(|w| w.to_device(device))
                .transpose()?,
            len: self.len,
        })
    }

    /// Rows `start..start + len` of every tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the batch.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            images: self.images.narrow(0, start, len)?,
            masks: self.masks.narrow(0, start, len)?,
            weight_maps: self
                .weight_maps
                .as_ref()
                .map(|w| w.narrow(0, start, len))
                .transpose()?,
            len,
        })
    }
}

fn stack<'a>(
    volumes: impl Iterator<Item = &'a Volume>,
    shape: [usize; 4],
    what: &str,
) -> Result<Tensor> {
    let mut data = Vec::new();
    let mut count = 0;
    for volume in volumes {
        if volume.shape() != shape {
            return Err(TrainError::Dataset(format!(
                "{what} shapes differ within a batch: {shape:?} vs {:?}",
                volume.shape()
            )));
        }
        data.extend_from_slice(volume.data());
        count += 1;
    }
    let [c, d, h, w] = shape;
    Ok(Tensor::from_vec(data, (count, c, d, h, w), &Device::Cpu)?)
}

/// Loader settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Samples per batch; the last batch may be smaller.
    pub batch_size: usize,
    /// Shuffle the index order every epoch.
    pub shuffle: bool,
    /// Worker threads; 0 loads on the calling thread.
    pub workers: usize,
    /// Batches buffered per worker.
    pub prefetch_factor: usize,
    /// Base seed for shuffling and augmentation.
    pub seed: u64,
}

/// Produces the batches of one epoch at a time.
pub struct DataLoader {
    dataset: Arc<dyn VolumeDataset>,
    config: LoaderConfig,
}

impl DataLoader {
    /// Loader over `dataset`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] for a zero batch size or prefetch factor.
    pub fn new(dataset: Arc<dyn VolumeDataset>, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be > 0".into()));
        }
        if config.prefetch_factor == 0 {
            return Err(TrainError::Config("prefetch_factor must be > 0".into()));
        }
        Ok(Self { dataset, config })
    }

    /// Samples per epoch.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.dataset.len()
    }

    /// Batches per epoch.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size)
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> LoaderConfig {
        self.config
    }

    fn plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.epoch_seed(epoch));
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    fn epoch_seed(&self, epoch: usize) -> u64 {
        self.config.seed.wrapping_add(epoch as u64)
    }

    /// Iterate the batches of `epoch` in a fixed order.
    #[must_use]
    pub fn epoch(&self, epoch: usize) -> EpochBatches {
        let plan = Arc::new(self.plan(epoch));
        let seed = self.epoch_seed(epoch);
        let total = plan.len();

        if self.config.workers == 0 {
            return EpochBatches {
                source: Source::Inline {
                    dataset: Arc::clone(&self.dataset),
                    plan,
                    seed,
                },
                next: 0,
                total,
            };
        }

        let capacity = self.config.workers * self.config.prefetch_factor;
        let (tx, rx) = mpsc::sync_channel(capacity);
        let cursor = Arc::new(AtomicUsize::new(0));
        let window = Arc::new(PrefetchWindow::new(capacity));
        let handles = (0..self.config.workers.min(total.max(1)))
            .map(|worker| {
                let tx = tx.clone();
                let dataset = Arc::clone(&self.dataset);
                let plan = Arc::clone(&plan);
                let cursor = Arc::clone(&cursor);
                let window = Arc::clone(&window);
                thread::Builder::new()
                    .name(format!("loader-{worker}"))
                    .spawn(move || loop {
                        let index = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(indices) = plan.get(index) else {
                            break;
                        };
                        if !window.admit(index) {
                            break;
                        }
                        let batch = load_batch(dataset.as_ref(), indices, seed, index);
                        if tx.send((index, batch)).is_err() {
                            // consumer went away
                            break;
                        }
                    })
            })
            .collect::<std::io::Result<Vec<JoinHandle<()>>>>();
        drop(tx);

        let source = match handles {
            Ok(handles) => Source::Workers {
                rx: Some(rx),
                window,
                handles,
                pending: BTreeMap::new(),
            },
            Err(err) => Source::Failed(Some(err.into())),
        };
        EpochBatches {
            source,
            next: 0,
            total,
        }
    }
}

fn load_batch(
    dataset: &dyn VolumeDataset,
    indices: &[usize],
    seed: u64,
    batch_index: usize,
) -> Result<Batch> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(batch_index as u64);
    let samples = indices
        .iter()
        .map(|&i| dataset.load(i, &mut rng))
        .collect::<Result<Vec<_>>>()?;
    Batch::collate(&samples)
}

/// Limits how far workers may run ahead of the consumer.
struct PrefetchWindow {
    capacity: usize,
    state: Mutex<WindowState>,
    moved: Condvar,
}

struct WindowState {
    consumed: usize,
    closed: bool,
}

impl PrefetchWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(WindowState {
                consumed: 0,
                closed: false,
            }),
            moved: Condvar::new(),
        }
    }

    /// Block until batch `index` fits in the window. `false` once closed.
    fn admit(&self, index: usize) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        let waited = self.moved.wait_while(state, |state| {
            !state.closed && index >= state.consumed + self.capacity
        });
        waited.is_ok_and(|state| !state.closed)
    }

    fn advance(&self, consumed: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.consumed = consumed;
        }
        self.moved.notify_all();
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.moved.notify_all();
    }
}

enum Source {
    Inline {
        dataset: Arc<dyn VolumeDataset>,
        plan: Arc<Vec<Vec<usize>>>,
        seed: u64,
    },
    Workers {
        rx: Option<Receiver<(usize, Result<Batch>)>>,
        window: Arc<PrefetchWindow>,
        handles: Vec<JoinHandle<()>>,
        pending: BTreeMap<usize, Result<Batch>>,
    },
    Failed(Option<TrainError>),
}

/// Batches of one epoch, yielded in plan order.
pub struct EpochBatches {
    source: Source,
    next: usize,
    total: usize,
}

impl EpochBatches {
    /// Number of batches in the epoch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether the epoch has no batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl Iterator for EpochBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let index = self.next;
        let item = match &mut self.source {
            Source::Inline {
                dataset,
                plan,
                seed,
            } => {
                let indices = plan.get(index)?;
                load_batch(dataset.as_ref(), indices, *seed, index)
            }
            Source::Workers {
                rx, window, pending, ..
            } => loop {
                if let Some(batch) = pending.remove(&index) {
                    window.advance(index + 1);
                    break batch;
                }
                let received = rx.as_ref().map(Receiver::recv);
                match received {
                    Some(Ok((i, batch))) => {
                        pending.insert(i, batch);
                    }
                    _ => {
                        break Err(TrainError::Dataset(format!(
                            "loader workers stopped before batch {index}"
                        )))
                    }
                }
            },
            Source::Failed(err) => {
                let err = err.take().unwrap_or_else(|| {
                    TrainError::Dataset("loader workers could not be started".into())
                });
                self.next = self.total;
                return Some(Err(err));
            }
        };
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let Source::Workers {
            rx,
            window,
            handles,
            ..
        } = &mut self.source
        {
            // unblock workers waiting on the window or a full channel
            window.close();
            rx.take();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SyntheticDataset;

    fn loader(size: usize, batch: usize, workers: usize, shuffle: bool) -> DataLoader {
        let dataset = SyntheticDataset::new([1, 3, 3, 3], size, 2, 5).unwrap();
        DataLoader::new(
            Arc::new(dataset),
            LoaderConfig {
                batch_size: batch,
                shuffle,
                workers,
                prefetch_factor: 1,
                seed: 9,
            },
        )
        .unwrap()
    }

    fn collect(loader: &DataLoader, epoch: usize) -> Vec<Vec<f32>> {
        loader
            .epoch(epoch)
            .map(|b| b.unwrap().images.flatten_all().unwrap().to_vec1().unwrap())
            .collect()
    }

    #[test]
    fn test_batch_sizes_cover_dataset() {
        let l = loader(5, 2, 0, false);
        assert_eq!(l.batch_count(), 3);
        let sizes: Vec<usize> = l.epoch(0).map(|b| b.unwrap().len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_batch_shapes() {
        let l = loader(4, 4, 0, false);
        let batch = l.epoch(0).next().unwrap().unwrap();
        assert_eq!(batch.images.dims(), &[4, 1, 3, 3, 3]);
        assert_eq!(batch.masks.dims(), &[4, 2, 3, 3, 3]);
        assert!(batch.weight_maps.is_none());
    }

    #[test]
    fn test_workers_match_inline_order() {
        let inline = collect(&loader(9, 2, 0, true), 1);
        let threaded = collect(&loader(9, 2, 3, true), 1);
        assert_eq!(inline, threaded);
    }

    #[test]
    fn test_shuffle_changes_with_epoch() {
        let l = loader(8, 8, 0, true);
        assert_ne!(collect(&l, 0), collect(&l, 1));
        assert_eq!(collect(&l, 2), collect(&l, 2));
    }

    #[test]
    fn test_early_drop_does_not_hang() {
        let l = loader(20, 1, 2, false);
        let mut batches = l.epoch(0);
        assert!(batches.next().unwrap().is_ok());
        drop(batches);
    }

    /// Counts loads; sample 0 is slow so later batches finish first.
    struct SlowFirstDataset {
        inner: SyntheticDataset,
        loads: AtomicUsize,
    }

    impl VolumeDataset for SlowFirstDataset {
        fn len(&self) -> usize {
            self.inner.len()
        }

        fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<Sample> {
            if index == 0 {
                thread::sleep(std::time::Duration::from_millis(300));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(index, rng)
        }
    }

    #[test]
    fn test_prefetch_stays_within_window() {
        let dataset = Arc::new(SlowFirstDataset {
            inner: SyntheticDataset::new([1, 2, 2, 2], 200, 1, 0).unwrap(),
            loads: AtomicUsize::new(0),
        });
        let config = LoaderConfig {
            batch_size: 1,
            shuffle: false,
            workers: 2,
            prefetch_factor: 1,
            seed: 0,
        };
        let capacity = config.workers * config.prefetch_factor;
        let l = DataLoader::new(Arc::clone(&dataset) as Arc<dyn VolumeDataset>, config).unwrap();

        let mut batches = l.epoch(0);
        assert!(batches.next().unwrap().is_ok());
        let loaded = dataset.loads.load(Ordering::SeqCst);
        assert!(
            loaded <= capacity + config.workers,
            "{loaded} batches loaded with a window of {capacity}"
        );

        // the rest of the epoch still arrives, in order
        assert_eq!(batches.filter(Result::is_ok).count(), 199);
    }

    #[test]
    fn test_collate_rejects_mixed_weight_maps() {
        let sample = |weights: bool| {
            let v = Volume::zeros([1, 2, 2, 2]).unwrap();
            Sample::new(v.clone(), v.clone(), weights.then(|| v.clone())).unwrap()
        };
        assert!(Batch::collate(&[sample(true), sample(false)]).is_err());
        let batch = Batch::collate(&[sample(true), sample(true)]).unwrap();
        assert_eq!(batch.weight_maps.unwrap().dims(), &[2, 1, 2, 2, 2]);
    }

    #[test]
    fn test_narrow_splits_batch() {
        let l = loader(4, 4, 0, false);
        let batch = l.epoch(0).next().unwrap().unwrap();
        let part = batch.narrow(1, 2).unwrap();
        assert_eq!(part.len, 2);
        assert_eq!(part.images.dims()[0], 2);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dataset = SyntheticDataset::new([1, 2, 2, 2], 1, 1, 0).unwrap();
        let result = DataLoader::new(
            Arc::new(dataset),
            LoaderConfig {
                batch_size: 0,
                shuffle: false,
                workers: 0,
                prefetch_factor: 1,
                seed: 0,
            },
        );
        assert!(result.is_err());
    }
}
