//! Training checkpoints.
//!
//! A checkpoint is a directory holding `model-<epoch>.safetensors` and
//! `checkpoint.json`. The weights are written first under a name no older
//! metadata points at, then the metadata rename commits them. A crash at any
//! point leaves the previous checkpoint loadable.

use crate::model::GptConfig;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use recipes_core::Result;
use recipes_core::error::CheckpointError;
use recipes_core::persistence::{atomic_write_json, atomic_write_with, load_json};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const METADATA_FILE: &str = "checkpoint.json";

const WEIGHTS_PREFIX: &str = "model-";
const WEIGHTS_EXTENSION: &str = ".safetensors";

/// Weights file name for the checkpoint taken after `finished_epoch`.
pub fn weights_file_name(finished_epoch: usize) -> String {
    format!("{WEIGHTS_PREFIX}{finished_epoch}{WEIGHTS_EXTENSION}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Index of the last fully completed training epoch.
    pub finished_epoch: usize,
    pub job_name: String,
    pub saved_at: DateTime<Utc>,
    /// File in the checkpoint directory holding the weights.
    pub weights_file: String,
    pub weights_sha256: String,
    pub model: GptConfig,
}

/// A checkpoint loaded into host memory.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub weights: HashMap<String, Tensor>,
    pub dir: PathBuf,
}

impl Checkpoint {
    /// Overwrite every variable in `varmap` with the saved weights.
    ///
    /// Names and shapes must match exactly; nothing is written unless the
    /// whole checkpoint fits.
    pub fn apply_to(&self, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter map poisoned".into()))?;

        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        for name in &names {
            let saved = self
                .weights
                .get(*name)
                .ok_or_else(|| CheckpointError::MissingParameter {
                    name: (*name).clone(),
                })?;
            let var = &data[*name];
            if saved.dims() != var.dims() {
                return Err(CheckpointError::ShapeMismatch {
                    name: (*name).clone(),
                    expected: var.dims().to_vec(),
                    actual: saved.dims().to_vec(),
                }
                .into());
            }
        }
        let mut unexpected: Vec<&String> = self
            .weights
            .keys()
            .filter(|k| !data.contains_key(*k))
            .collect();
        unexpected.sort();
        if let Some(name) = unexpected.first() {
            return Err(CheckpointError::UnexpectedParameter {
                name: (*name).clone(),
            }
            .into());
        }

        for (name, var) in data.iter() {
            let saved = &self.weights[name];
            var.set(&saved.to_dtype(var.dtype())?.to_device(var.device())?)?;
        }
        Ok(())
    }
}

/// Load the checkpoint in `path`, if one exists there.
pub fn load_checkpoint(path: Option<&Path>) -> Result<Option<Checkpoint>> {
    let Some(dir) = path else {
        return Ok(None);
    };
    let Some(meta) = load_json::<CheckpointMeta>(&dir.join(METADATA_FILE))? else {
        debug!(path = %dir.display(), "No checkpoint found, starting fresh");
        return Ok(None);
    };

    if Path::new(&meta.weights_file).file_name() != Some(OsStr::new(&meta.weights_file)) {
        return Err(CheckpointError::InvalidMetadata {
            path: dir.join(METADATA_FILE),
            reason: format!("weights file {:?} is not a plain file name", meta.weights_file),
        }
        .into());
    }
    let weights_path = dir.join(&meta.weights_file);
    let bytes = std::fs::read(&weights_path)?;
    if sha256_hex(&bytes) != meta.weights_sha256 {
        return Err(CheckpointError::DigestMismatch { path: weights_path }.into());
    }
    let weights = candle_core::safetensors::load_buffer(&bytes, &Device::Cpu)?;

    info!(
        path = %dir.display(),
        finished_epoch = meta.finished_epoch,
        job_name = %meta.job_name,
        "Loaded checkpoint"
    );
    Ok(Some(Checkpoint {
        meta,
        weights,
        dir: dir.to_path_buf(),
    }))
}

/// Write the variables of `varmap` as a checkpoint into `dir`.
pub fn save_checkpoint(
    dir: &Path,
    varmap: &VarMap,
    finished_epoch: usize,
    job_name: &str,
    model: &GptConfig,
) -> Result<CheckpointMeta> {
    let tensors: HashMap<String, Tensor> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter map poisoned".into()))?;
        data.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_device(&Device::Cpu)?)))
            .collect::<candle_core::Result<_>>()?
    };

    let weights_file = weights_file_name(finished_epoch);
    let weights_path = dir.join(&weights_file);
    atomic_write_with(&weights_path, |tmp| -> Result<()> {
        candle_core::safetensors::save(&tensors, tmp)?;
        Ok(())
    })?;
    let digest = sha256_hex(&std::fs::read(&weights_path)?);

    let meta = CheckpointMeta {
        finished_epoch,
        job_name: job_name.to_string(),
        saved_at: Utc::now(),
        weights_file,
        weights_sha256: digest,
        model: model.clone(),
    };
    atomic_write_json(&dir.join(METADATA_FILE), &meta)?;
    info!(path = %dir.display(), finished_epoch, "Saved checkpoint");

    prune_stale_weights(dir, &meta.weights_file);
    Ok(meta)
}

/// Remove weights files the committed metadata no longer points at.
///
/// Failures only cost disk space, so they are logged and skipped.
fn prune_stale_weights(dir: &Path, keep: &str) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Could not list checkpoint directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let stale = name != keep
            && name.starts_with(WEIGHTS_PREFIX)
            && (name.ends_with(WEIGHTS_EXTENSION) || name.ends_with(".tmp"));
        if stale {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!(file = name, error = %e, "Could not remove stale weights");
            } else {
                debug!(file = name, "Removed stale weights");
            }
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
