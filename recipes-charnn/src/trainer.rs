//! Epoch loop for the character model.
//!
//! Every rank runs the same number of steps per epoch; gradients are
//! averaged across the group before each optimizer step. Rank 0 alone
//! writes metrics, the profile and checkpoints.

use crate::checkpoint::save_checkpoint;
use crate::dataset::Subset;
use crate::loader::{DataLoader, LoaderConfig};
use crate::model::{Gpt, LanguageModel};
use crate::profile::{Phase, Profiler};
use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{AdamW, Optimizer};
use recipes_core::Result;
use recipes_core::config::TrainerSection;
use recipes_core::persistence::atomic_write_json;
use recipes_dist::DistributedDataParallel;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

pub const METRICS_FILE: &str = "metrics.jsonl";
pub const PROFILE_FILE: &str = "profile.json";

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub job_name: String,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub data_loader_workers: usize,
    pub enable_profile: bool,
    pub log_dir: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
    pub grad_norm_clip: f64,
    pub log_every: usize,
    /// Base seed for the per-epoch shuffle.
    pub seed: u64,
}

impl TrainerConfig {
    pub fn from_section(job_name: impl Into<String>, section: &TrainerSection, seed: u64) -> Self {
        Self {
            job_name: job_name.into(),
            max_epochs: section.max_epochs,
            batch_size: section.batch_size,
            data_loader_workers: section.data_loader_workers,
            enable_profile: section.enable_profile,
            log_dir: section.log_dir.clone(),
            checkpoint_path: section.checkpoint_path.clone(),
            grad_norm_clip: section.grad_norm_clip,
            log_every: section.log_every,
            seed,
        }
    }

    /// Directory for this job's run artifacts, if logging to disk.
    pub fn run_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| dir.join(&self.job_name))
    }
}

/// Group-averaged losses of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    /// `None` when the test split is empty.
    pub test_loss: Option<f64>,
    /// Training steps this rank ran.
    pub iterations: u64,
    pub elapsed_secs: f64,
}

pub struct Trainer {
    model: DistributedDataParallel<Gpt>,
    optimizer: AdamW,
    train: DataLoader,
    test: DataLoader,
    config: TrainerConfig,
    start_epoch: usize,
    profiler: Profiler,
}

impl Trainer {
    pub fn new(
        model: DistributedDataParallel<Gpt>,
        optimizer: AdamW,
        train: Subset,
        test: Subset,
        config: TrainerConfig,
        start_epoch: usize,
    ) -> Self {
        let group = model.group();
        let loader = |subset, shuffle| {
            DataLoader::new(
                subset,
                LoaderConfig {
                    batch_size: config.batch_size,
                    workers: config.data_loader_workers,
                    shuffle,
                    seed: config.seed,
                    rank: group.rank(),
                    world_size: group.world_size(),
                },
                model.device().clone(),
            )
        };
        let train = loader(train, true);
        let test = loader(test, false);
        Self {
            profiler: Profiler::new(config.enable_profile),
            model,
            optimizer,
            train,
            test,
            config,
            start_epoch,
        }
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn model(&self) -> &DistributedDataParallel<Gpt> {
        &self.model
    }

    /// Train from the start epoch through `max_epochs - 1`.
    ///
    /// `max_iter` caps the number of steps of each train and test pass.
    pub async fn fit(&mut self, max_iter: Option<u64>) -> Result<Vec<EpochReport>> {
        let mut reports = Vec::new();
        let rank = self.model.group().rank();
        info!(
            rank,
            job_name = %self.config.job_name,
            start_epoch = self.start_epoch,
            max_epochs = self.config.max_epochs,
            batches_per_epoch = self.train.num_batches(),
            "Starting training"
        );

        for epoch in self.start_epoch..self.config.max_epochs {
            let started = Instant::now();
            let (train_sum, iterations) = self.train_epoch(epoch, max_iter).await?;
            let (test_sum, test_batches) = self.evaluate(epoch, max_iter)?;

            let mut totals = [
                train_sum as f32,
                iterations as f32,
                test_sum as f32,
                test_batches as f32,
            ];
            self.model.group().all_reduce_sum_f32(&mut totals).await?;
            let report = EpochReport {
                epoch,
                train_loss: mean(totals[0], totals[1]).unwrap_or(f64::NAN),
                test_loss: mean(totals[2], totals[3]),
                iterations,
                elapsed_secs: started.elapsed().as_secs_f64(),
            };

            if rank == 0 {
                info!(
                    epoch,
                    train_loss = report.train_loss,
                    test_loss = ?report.test_loss,
                    elapsed_secs = report.elapsed_secs,
                    "Epoch finished"
                );
                self.append_metrics(&report)?;
                if let Some(dir) = &self.config.checkpoint_path {
                    save_checkpoint(
                        dir,
                        self.model.varmap(),
                        epoch,
                        &self.config.job_name,
                        self.model.module().config(),
                    )?;
                }
            }
            reports.push(report);
        }

        if rank == 0 && self.profiler.is_enabled() {
            self.write_profile()?;
        }
        Ok(reports)
    }

    async fn train_epoch(&mut self, epoch: usize, max_iter: Option<u64>) -> Result<(f64, u64)> {
        let params = self.model.parameters()?;
        let rank = self.model.group().rank();
        let mut batches = self.train.epoch(epoch);
        let mut loss_sum = 0.0;
        let mut iterations = 0u64;

        loop {
            if max_iter.is_some_and(|max| iterations >= max) {
                break;
            }
            let fetched = Instant::now();
            let Some(batch) = batches.next() else {
                break;
            };
            let batch = batch?;
            self.profiler.record(Phase::Data, fetched.elapsed());

            let started = Instant::now();
            let logits = self.model.forward(&batch.x, true)?;
            let loss = Gpt::loss(&logits, &batch.y)?;
            self.profiler.record(Phase::Forward, started.elapsed());

            let started = Instant::now();
            let mut grads = loss.backward()?;
            self.profiler.record(Phase::Backward, started.elapsed());

            let started = Instant::now();
            self.model.sync_gradients(&mut grads).await?;
            self.profiler.record(Phase::Sync, started.elapsed());

            let started = Instant::now();
            let norm = clip_grad_norm(&mut grads, &params, self.config.grad_norm_clip)?;
            self.optimizer.step(&grads)?;
            self.profiler.record(Phase::Step, started.elapsed());
            self.profiler.finish_step();

            let loss = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            loss_sum += loss;
            if rank == 0 && self.config.log_every > 0 && iterations % self.config.log_every as u64 == 0 {
                info!(epoch, iter = iterations, loss, grad_norm = norm, "train");
            }
            iterations += 1;
        }
        Ok((loss_sum, iterations))
    }

    fn evaluate(&self, epoch: usize, max_iter: Option<u64>) -> Result<(f64, u64)> {
        let mut loss_sum = 0.0;
        let mut batches = 0u64;
        for batch in self.test.epoch(epoch) {
            if max_iter.is_some_and(|max| batches >= max) {
                break;
            }
            let batch = batch?;
            let logits = self.model.forward(&batch.x, false)?;
            loss_sum += Gpt::loss(&logits, &batch.y)?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            batches += 1;
        }
        debug!(epoch, batches, "Evaluation pass done");
        Ok((loss_sum, batches))
    }

    fn append_metrics(&self, report: &EpochReport) -> Result<()> {
        let Some(dir) = self.config.run_dir() else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(METRICS_FILE))?;
        writeln!(file, "{}", serde_json::to_string(report)?)?;
        Ok(())
    }

    fn write_profile(&self) -> Result<()> {
        let report = self.profiler.report();
        match self.config.run_dir() {
            Some(dir) => {
                let path = dir.join(PROFILE_FILE);
                atomic_write_json(&path, &report)?;
                info!(path = %path.display(), steps = report.steps, "Wrote profile");
            }
            None => info!(profile = %serde_json::to_string(&report)?, "Training profile"),
        }
        Ok(())
    }
}

fn mean(sum: f32, count: f32) -> Option<f64> {
    (count > 0.0).then(|| sum as f64 / count as f64)
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. A non-positive `max_norm` disables
/// clipping.
pub fn clip_grad_norm(grads: &mut GradStore, params: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0.0;
    for var in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in params {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * scale)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(norm)
}
