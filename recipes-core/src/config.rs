//! Run configuration for the recipes.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> command-line overrides. Values are immutable once loaded.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};

/// Environment prefix for charnn overrides (`CHARNN_TRAINER__MAX_EPOCHS=3`).
pub const CHARNN_ENV_PREFIX: &str = "CHARNN_";

/// Top-level configuration of the charnn recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub trainer: TrainerSection,
    #[serde(default)]
    pub opt: OptimizerConfig,
    #[serde(default)]
    pub charnn: CharnnConfig,
    #[serde(default)]
    pub dist: DistConfig,
    /// Cap on training iterations per epoch; unbounded when absent.
    #[serde(default)]
    pub max_iter: Option<u64>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            model: ModelConfig::default(),
            trainer: TrainerSection::default(),
            opt: OptimizerConfig::default(),
            charnn: CharnnConfig::default(),
            dist: DistConfig::default(),
            max_iter: None,
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Path to the text corpus, relative to the working directory.
    #[serde(default = "default_dataset_path")]
    pub path: PathBuf,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: default_dataset_path(),
        }
    }
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("data/input.txt")
}

/// GPT hyper-parameters that come from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    #[serde(default = "default_n_embd")]
    pub n_embd: usize,
    /// Context window of the model, in symbols.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_pdrop")]
    pub embd_pdrop: f32,
    #[serde(default = "default_pdrop")]
    pub resid_pdrop: f32,
    #[serde(default = "default_pdrop")]
    pub attn_pdrop: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_layer: default_n_layer(),
            n_head: default_n_head(),
            n_embd: default_n_embd(),
            block_size: default_block_size(),
            embd_pdrop: default_pdrop(),
            resid_pdrop: default_pdrop(),
            attn_pdrop: default_pdrop(),
        }
    }
}

fn default_n_layer() -> usize {
    8
}

fn default_n_head() -> usize {
    8
}

fn default_n_embd() -> usize {
    512
}

fn default_block_size() -> usize {
    128
}

fn default_pdrop() -> f32 {
    0.1
}

/// Training-loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSection {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub data_loader_workers: usize,
    #[serde(default)]
    pub enable_profile: bool,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    #[serde(default = "default_grad_norm_clip")]
    pub grad_norm_clip: f64,
    /// Log training loss every N iterations.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

impl Default for TrainerSection {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            batch_size: default_batch_size(),
            data_loader_workers: 0,
            enable_profile: false,
            log_dir: None,
            checkpoint_path: None,
            grad_norm_clip: default_grad_norm_clip(),
            log_every: default_log_every(),
        }
    }
}

fn default_max_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    64
}

fn default_grad_norm_clip() -> f64 {
    1.0
}

fn default_log_every() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: default_weight_decay(),
        }
    }
}

fn default_lr() -> f64 {
    3e-4
}

fn default_weight_decay() -> f64 {
    0.1
}

/// Task selection and generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharnnConfig {
    /// `train` or `generate`.
    #[serde(default = "default_task")]
    pub task: String,
    /// Seed text for generation.
    #[serde(default = "default_phrase")]
    pub phrase: String,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Sample from the distribution; argmax when false.
    #[serde(default = "default_true")]
    pub sample: bool,
    #[serde(default = "default_top_k")]
    pub top_k: Option<usize>,
}

impl Default for CharnnConfig {
    fn default() -> Self {
        Self {
            task: default_task(),
            phrase: default_phrase(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            sample: true,
            top_k: default_top_k(),
        }
    }
}

fn default_task() -> String {
    "train".to_string()
}

fn default_phrase() -> String {
    "Hello there".to_string()
}

fn default_max_new_tokens() -> usize {
    2000
}

fn default_temperature() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_top_k() -> Option<usize> {
    Some(10)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistConfig {
    /// How long to wait for every rank to join the process group.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DistConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_seed() -> u64 {
    42
}

impl RunConfig {
    /// Load the run configuration and validate it.
    pub fn load(file: Option<&Path>, overrides: &[String]) -> Result<Self, ConfigError> {
        let config: RunConfig = load_layered(file, CHARNN_ENV_PREFIX, overrides)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.model;
        if m.n_head == 0 || m.n_layer == 0 || m.n_embd == 0 {
            return Err(ConfigError::invalid("model", "n_layer, n_head and n_embd must be positive"));
        }
        if m.n_embd % m.n_head != 0 {
            return Err(ConfigError::invalid(
                "model.n_embd",
                format!("{} is not divisible by n_head {}", m.n_embd, m.n_head),
            ));
        }
        if m.block_size == 0 {
            return Err(ConfigError::invalid("model.block_size", "must be positive"));
        }
        for (key, p) in [
            ("model.embd_pdrop", m.embd_pdrop),
            ("model.resid_pdrop", m.resid_pdrop),
            ("model.attn_pdrop", m.attn_pdrop),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(ConfigError::invalid(key, format!("{p} not in [0, 1)")));
            }
        }
        if self.trainer.batch_size == 0 {
            return Err(ConfigError::invalid("trainer.batch_size", "must be positive"));
        }
        if self.opt.lr <= 0.0 {
            return Err(ConfigError::invalid("opt.lr", "must be positive"));
        }
        if self.charnn.temperature <= 0.0 {
            return Err(ConfigError::invalid("charnn.temperature", "must be positive"));
        }
        if self.charnn.top_k == Some(0) {
            return Err(ConfigError::invalid("charnn.top_k", "must be positive"));
        }
        Ok(())
    }

    /// Dataset path resolved against the working directory.
    pub fn dataset_path(&self) -> PathBuf {
        resolve_path(&self.dataset.path)
    }
}

/// Resolve a possibly relative path against the working directory.
pub fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Merge defaults, an optional TOML file, prefixed environment variables and
/// `key.path=value` overrides into `T`.
pub fn load_layered<T>(
    file: Option<&Path>,
    env_prefix: &str,
    overrides: &[String],
) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(file) = file {
        if !file.exists() {
            return Err(ConfigError::invalid(
                "config",
                format!("{} does not exist", file.display()),
            ));
        }
        figment = figment.merge(Toml::file(file));
    }

    figment = figment.merge(Env::prefixed(env_prefix).split("__"));

    for raw in overrides {
        let (key, value) = parse_override(raw)?;
        figment = figment.merge(Serialized::default(&key, value));
    }

    figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
}

/// Split `key.path=value` and type the value the way TOML would.
pub fn parse_override(raw: &str) -> Result<(String, toml::Value), ConfigError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride {
            raw: raw.to_string(),
        })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::InvalidOverride {
            raw: raw.to_string(),
        });
    }
    let value = value.trim();
    let typed = toml::from_str::<toml::Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));
    Ok((key.to_string(), typed))
}
