//! End-to-end wiring of the character-model recipe.

use crate::builder::build_ddp_model_and_optimizer;
use crate::checkpoint::load_checkpoint;
use crate::dataset::{CharDataset, random_split};
use crate::dispatch::{Outcome, Prepared, Task, dispatch, start_epoch};
use crate::model::GptConfig;
use recipes_core::{DeviceHandle, LaunchEnv, Result, RunConfig};
use recipes_dist::{Backend, ProcessGroup};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Run the recipe, writing any completion to standard output.
pub async fn run(config: &RunConfig, env: &LaunchEnv) -> Result<Outcome> {
    let mut stdout = std::io::stdout();
    run_with_output(config, env, &mut stdout).await
}

pub async fn run_with_output<W: Write>(
    config: &RunConfig,
    env: &LaunchEnv,
    out: &mut W,
) -> Result<Outcome> {
    let task: Task = config.charnn.task.parse()?;

    let device = DeviceHandle::select(env.local_rank);
    let backend = Backend::for_device(&device);
    let timeout = Duration::from_secs(config.dist.timeout_secs);
    let group = Arc::new(ProcessGroup::init(env, backend, timeout).await?);

    let job_name = env.job_name();
    let data_path = config.dataset_path();
    info!(
        pid = std::process::id(),
        rank = env.rank,
        device = %device,
        backend = %backend,
        %task,
        job_name = %job_name,
        data_path = %data_path.display(),
        "Running charnn"
    );

    let dataset = Arc::new(CharDataset::from_file(&data_path, config.model.block_size)?);
    let (train, test) = random_split(dataset.clone(), config.seed);
    info!(train = train.len(), test = test.len(), "Dataset split");

    let model_config = GptConfig::new(dataset.vocab_size(), dataset.block_size(), &config.model);
    let checkpoint = load_checkpoint(config.trainer.checkpoint_path.as_deref())?;
    let (model, optimizer) = build_ddp_model_and_optimizer(
        &model_config,
        &config.opt,
        checkpoint.as_ref(),
        device,
        group,
    )
    .await?;

    let prepared = Prepared {
        model,
        optimizer,
        train,
        test,
        job_name,
        start_epoch: start_epoch(checkpoint.as_ref()),
    };
    dispatch(task, config, prepared, out).await
}
