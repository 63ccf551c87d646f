//! Error types shared by the recipe crates.
//!
//! Every fatal condition a recipe can hit maps to one of the sub-enums below.
//! None of them are recovered locally: they bubble up to the binary, which
//! prints the chain and exits non-zero.

use std::path::PathBuf;

/// Top-level error type for the recipes.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Distributed error: {0}")]
    Distributed(#[from] DistError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from loading and validating the run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid override '{raw}': expected key=value")]
    InvalidOverride { raw: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Unknown task: {task}")]
    UnknownTask { task: String },
}

/// Errors from the launch environment (RANK, WORLD_SIZE, ...).
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Environment variable {name} is not an integer: '{value}'")]
    NotAnInteger { name: String, value: String },

    #[error("Rank {rank} is out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("World size must be at least 1")]
    EmptyWorld,

    #[error("Environment variable {name} is not valid UTF-8")]
    NotUnicode { name: String },
}

/// Errors from process-group setup and collectives.
#[derive(Debug, thiserror::Error)]
pub enum DistError {
    #[error("Process group join timed out after {timeout_secs}s ({joined} of {world_size} ranks)")]
    Timeout {
        timeout_secs: u64,
        joined: usize,
        world_size: usize,
    },

    #[error("Handshake rejected: {reason}")]
    Handshake { reason: String },

    #[error("Collective desync: expected {expected}, got {actual}")]
    Desync { expected: String, actual: String },

    #[error("Buffer length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

/// Errors from loading or validating a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint is missing parameter '{name}'")]
    MissingParameter { name: String },

    #[error("Checkpoint has unexpected parameter '{name}'")]
    UnexpectedParameter { name: String },

    #[error("Shape mismatch for '{name}': model {expected:?}, checkpoint {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Weights digest mismatch in {path}")]
    DigestMismatch { path: PathBuf },

    #[error("Checkpoint metadata missing at {path}")]
    MissingMetadata { path: PathBuf },

    #[error("Invalid checkpoint metadata at {path}: {reason}")]
    InvalidMetadata { path: PathBuf, reason: String },
}

/// Errors from dataset loading and encoding.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Corpus at {path} has {len} symbols, need more than block size {block_size}")]
    CorpusTooShort {
        path: PathBuf,
        len: usize,
        block_size: usize,
    },

    #[error("Symbol {symbol:?} is not in the dataset vocabulary")]
    UnknownSymbol { symbol: char },

    #[error("Malformed row {line} in {path}: {reason}")]
    MalformedRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Label {label} outside 0..{num_labels}")]
    LabelOutOfRange { label: usize, num_labels: usize },

    #[error("Vocabulary at {path} lacks required token '{token}'")]
    MissingSpecialToken { path: PathBuf, token: String },

    #[error("Tokenizer at {path} failed: {reason}")]
    Tokenizer { path: PathBuf, reason: String },

    #[error("Label {label:?} is not one of the configured label names")]
    UnknownLabel { label: String },

    #[error("The {split} split has no labels")]
    Unlabeled { split: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl DistError {
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = RecipeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_task_names_value() {
        let err: RecipeError = ConfigError::UnknownTask {
            task: "explode".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Unknown task: explode"
        );
    }

    #[test]
    fn test_env_error_display() {
        let err = EnvError::NotAnInteger {
            name: "RANK".into(),
            value: "zero".into(),
        };
        assert!(err.to_string().contains("RANK"));
        assert!(err.to_string().contains("zero"));
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = CheckpointError::ShapeMismatch {
            name: "lm_head.weight".into(),
            expected: vec![65, 64],
            actual: vec![60, 64],
        };
        let msg = err.to_string();
        assert!(msg.contains("lm_head.weight"));
        assert!(msg.contains("[65, 64]"));
    }
}
