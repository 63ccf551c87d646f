//! Batching over a dataset split.
//!
//! Each epoch the split is shuffled with a seed derived from the epoch,
//! padded by wrap-around to a multiple of the world size and sharded so rank
//! `r` takes every `world_size`-th item starting at `r`. Every rank therefore
//! runs the same number of steps, which keeps the gradient all-reduce in
//! lockstep.

use crate::dataset::Subset;
use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use recipes_core::Result;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

/// Batches a worker may assemble ahead of the consumer.
const PREFETCH_PER_WORKER: usize = 2;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Threads assembling batches; zero assembles inline.
    pub workers: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub rank: usize,
    pub world_size: usize,
}

/// Input and target indices shaped `(rows, block_size)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Tensor,
    pub y: Tensor,
}

/// A batch assembled in host memory.
#[derive(Debug, Clone, PartialEq)]
struct HostBatch {
    rows: usize,
    x: Vec<u32>,
    y: Vec<u32>,
}

pub struct DataLoader {
    subset: Subset,
    config: LoaderConfig,
    device: Device,
}

impl DataLoader {
    pub fn new(subset: Subset, config: LoaderConfig, device: Device) -> Self {
        Self {
            subset,
            config,
            device,
        }
    }

    /// Positions into the subset that this rank visits in `epoch`.
    pub fn shard(&self, epoch: usize) -> Vec<usize> {
        shard_positions(
            self.subset.len(),
            self.config.shuffle,
            self.config.seed.wrapping_add(epoch as u64),
            self.config.rank,
            self.config.world_size,
        )
    }

    /// Number of batches per epoch on this rank.
    pub fn num_batches(&self) -> usize {
        let per_rank = self.shard(0).len();
        per_rank.div_ceil(self.config.batch_size.max(1))
    }

    /// Iterate the batches of one epoch.
    pub fn epoch(&self, epoch: usize) -> BatchIter {
        let positions = self.shard(epoch);
        let items: Vec<usize> = positions
            .into_iter()
            .map(|p| self.subset.indices()[p])
            .collect();
        let plan = Arc::new(BatchPlan {
            subset: self.subset.clone(),
            items,
            batch_size: self.config.batch_size.max(1),
        });
        BatchIter::new(plan, self.config.workers, self.device.clone())
    }
}

/// Sharded, optionally shuffled positions for one rank.
pub fn shard_positions(
    len: usize,
    shuffle: bool,
    seed: u64,
    rank: usize,
    world_size: usize,
) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..len).collect();
    if shuffle {
        order.shuffle(&mut StdRng::seed_from_u64(seed));
    }
    let world_size = world_size.max(1);
    let padded = len.div_ceil(world_size) * world_size;
    (rank..padded)
        .step_by(world_size)
        .map(|i| order[i % len])
        .collect()
}

struct BatchPlan {
    subset: Subset,
    /// Dataset item indices in visiting order.
    items: Vec<usize>,
    batch_size: usize,
}

impl BatchPlan {
    fn len(&self) -> usize {
        self.items.len().div_ceil(self.batch_size)
    }

    fn assemble(&self, batch: usize) -> HostBatch {
        let start = batch * self.batch_size;
        let end = (start + self.batch_size).min(self.items.len());
        let dataset = self.subset.dataset();
        let block = dataset.block_size();
        let mut x = Vec::with_capacity((end - start) * block);
        let mut y = Vec::with_capacity((end - start) * block);
        for &item in &self.items[start..end] {
            let (xi, yi) = dataset.get(item);
            x.extend_from_slice(xi);
            y.extend_from_slice(yi);
        }
        HostBatch {
            rows: end - start,
            x,
            y,
        }
    }
}

enum Source {
    Inline,
    Workers {
        receivers: Vec<Receiver<HostBatch>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Batches of one epoch, in order.
pub struct BatchIter {
    plan: Arc<BatchPlan>,
    next: usize,
    source: Source,
    device: Device,
}

impl BatchIter {
    fn new(plan: Arc<BatchPlan>, workers: usize, device: Device) -> Self {
        let source = if workers == 0 || plan.len() == 0 {
            Source::Inline
        } else {
            let workers = workers.min(plan.len());
            let mut receivers = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (tx, rx) = sync_channel(PREFETCH_PER_WORKER);
                let plan = plan.clone();
                handles.push(std::thread::spawn(move || {
                    produce(&plan, worker, workers, tx);
                }));
                receivers.push(rx);
            }
            Source::Workers { receivers, handles }
        };
        Self {
            plan,
            next: 0,
            source,
            device,
        }
    }

    fn next_host(&mut self) -> Option<HostBatch> {
        if self.next >= self.plan.len() {
            return None;
        }
        let batch = self.next;
        self.next += 1;
        match &self.source {
            Source::Inline => Some(self.plan.assemble(batch)),
            Source::Workers { receivers, .. } => receivers[batch % receivers.len()].recv().ok(),
        }
    }
}

/// Worker `worker` of `workers` assembles batches `worker, worker + workers, ...`.
fn produce(plan: &BatchPlan, worker: usize, workers: usize, tx: SyncSender<HostBatch>) {
    for batch in (worker..plan.len()).step_by(workers) {
        if tx.send(plan.assemble(batch)).is_err() {
            // consumer went away
            return;
        }
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let host = self.next_host()?;
        let shape = (host.rows, self.plan.subset.dataset().block_size());
        let batch = Tensor::from_vec(host.x, shape, &self.device).and_then(|x| {
            Ok(Batch {
                x,
                y: Tensor::from_vec(host.y, shape, &self.device)?,
            })
        });
        Some(batch.map_err(Into::into))
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let Source::Workers { receivers, handles } = &mut self.source {
            receivers.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CharDataset, memory_source, random_split};
    use pretty_assertions::assert_eq;

    fn loader(workers: usize, rank: usize, world_size: usize) -> DataLoader {
        let ds = CharDataset::from_text(&"to be or not to be ".repeat(6), 8, &memory_source())
            .unwrap();
        let (train, _) = random_split(Arc::new(ds), 42);
        DataLoader::new(
            train,
            LoaderConfig {
                batch_size: 5,
                workers,
                shuffle: true,
                seed: 42,
                rank,
                world_size,
            },
            Device::Cpu,
        )
    }

    fn collect(loader: &DataLoader, epoch: usize) -> Vec<Vec<Vec<u32>>> {
        loader
            .epoch(epoch)
            .map(|b| b.unwrap().x.to_vec2::<u32>().unwrap())
            .collect()
    }

    #[test]
    fn test_shards_cover_every_position() {
        let len = 23;
        let world_size = 4;
        let mut seen = Vec::new();
        let mut sizes = Vec::new();
        for rank in 0..world_size {
            let shard = shard_positions(len, true, 1, rank, world_size);
            sizes.push(shard.len());
            seen.extend(shard);
        }
        // equal work per rank, padded by wrap-around
        assert!(sizes.iter().all(|&s| s == 6));
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (0..len).collect::<Vec<_>>());
    }

    #[test]
    fn test_unshuffled_single_rank_is_identity() {
        assert_eq!(shard_positions(4, false, 0, 0, 1), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_batches_have_expected_shape() {
        let loader = loader(0, 0, 1);
        let mut iter = loader.epoch(0);
        let batch = iter.next().unwrap().unwrap();
        assert_eq!(batch.x.dims(), &[5, 8]);
        assert_eq!(batch.y.dims(), &[5, 8]);
        let x = batch.x.to_vec2::<u32>().unwrap();
        let y = batch.y.to_vec2::<u32>().unwrap();
        // targets are inputs shifted by one
        assert_eq!(&x[0][1..], &y[0][..7]);
    }

    #[test]
    fn test_workers_match_inline_order() {
        let inline = collect(&loader(0, 0, 1), 3);
        let threaded = collect(&loader(3, 0, 1), 3);
        assert_eq!(inline, threaded);
        assert_eq!(inline.len(), loader(0, 0, 1).num_batches());
    }

    #[test]
    fn test_epochs_reshuffle() {
        let l = loader(0, 0, 1);
        assert_ne!(collect(&l, 0), collect(&l, 1));
    }

    #[test]
    fn test_early_drop_stops_workers() {
        let l = loader(2, 0, 1);
        let mut iter = l.epoch(0);
        assert!(iter.next().is_some());
        drop(iter);
    }
}
