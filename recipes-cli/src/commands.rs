//! Subcommand handlers.

use crate::logging;
use anyhow::Context;
use recipes_charnn::Outcome;
use recipes_core::{LaunchEnv, RunConfig, launch};
use recipes_text::{DocClassificationConfig, DocClassificationDataModule};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration picked up from the working directory when no `--config`
/// is given.
const DEFAULT_CHARNN_CONFIG: &str = "charnn.toml";

pub fn charnn(config: Option<PathBuf>, overrides: &[String], filter: &str) -> anyhow::Result<()> {
    // must run while the process is still single-threaded
    let applied = launch::set_env();
    let env = LaunchEnv::from_process().context("Invalid launch environment")?;

    let file = config.or_else(|| {
        let default = PathBuf::from(DEFAULT_CHARNN_CONFIG);
        default.exists().then_some(default)
    });
    let config = RunConfig::load(file.as_deref(), overrides)
        .context("Failed to load charnn configuration")?;

    let log_file = format!("{}.rank{}.log", env.job_name(), env.rank);
    let _guard = logging::init(filter, config.trainer.log_dir.as_deref(), &log_file)?;
    debug!(defaults = ?applied, config_file = ?file, "Launch environment ready");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let outcome = runtime.block_on(recipes_charnn::run(&config, &env))?;

    if let Outcome::Trained(reports) = outcome {
        if let Some(last) = reports.last() {
            info!(
                epochs = reports.len(),
                last_epoch = last.epoch,
                train_loss = last.train_loss,
                "Training complete"
            );
        } else {
            info!("Nothing to train; checkpoint already covers every epoch");
        }
    }
    Ok(())
}

pub fn doc_cls(config: &Path, overrides: &[String], filter: &str) -> anyhow::Result<()> {
    let _guard = logging::init(filter, None, "doc-cls.log")?;
    let config = DocClassificationConfig::load(Some(config), overrides)
        .context("Failed to load doc-cls configuration")?;
    let datamodule = DocClassificationDataModule::from_config(&config)?;

    let batch = datamodule
        .train_dataloader()
        .next()
        .context("The train split is empty")??;
    println!("token_ids: {:?}", batch.token_ids.dims());
    println!("label_ids: {:?}", batch.labels()?.dims());
    Ok(())
}
