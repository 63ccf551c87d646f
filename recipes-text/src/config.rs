//! Configuration of the document-classification datamodule.

use recipes_core::config::load_layered;
use recipes_core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment prefix for datamodule overrides (`DOC_CLS_BATCH_SIZE=32`).
pub const DOC_CLS_ENV_PREFIX: &str = "DOC_CLS_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocClassificationConfig {
    #[serde(default)]
    pub dataset: DatasetSection,
    /// Names of the positional columns of the labeled splits.
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,
    #[serde(default = "default_label_column")]
    pub label_column: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub transform: TransformConfig,
}

impl Default for DocClassificationConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetSection::default(),
            columns: default_columns(),
            label_column: default_label_column(),
            batch_size: default_batch_size(),
            transform: TransformConfig::default(),
        }
    }
}

fn default_columns() -> Vec<String> {
    vec!["text".to_string(), "label".to_string()]
}

fn default_label_column() -> String {
    "label".to_string()
}

fn default_batch_size() -> usize {
    16
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSection {
    /// Directory that contains `SST-2/`.
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// One token per line; the line number is the token id. Used when no
    /// `tokenizer_path` is set.
    #[serde(default = "default_vocab_path")]
    pub vocab_path: PathBuf,
    /// Serialized `tokenizers` pipeline (`tokenizer.json`).
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    /// Label strings in id order; labels are parsed as integers when unset.
    #[serde(default)]
    pub label_names: Option<Vec<String>>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            vocab_path: default_vocab_path(),
            tokenizer_path: None,
            num_labels: default_num_labels(),
            max_seq_len: default_max_seq_len(),
            label_names: None,
        }
    }
}

fn default_vocab_path() -> PathBuf {
    PathBuf::from("vocab.txt")
}

fn default_num_labels() -> usize {
    2
}

fn default_max_seq_len() -> usize {
    256
}

impl DocClassificationConfig {
    pub fn load(file: Option<&Path>, overrides: &[String]) -> Result<Self, ConfigError> {
        let config: Self = load_layered(file, DOC_CLS_ENV_PREFIX, overrides)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be positive"));
        }
        if self.transform.num_labels == 0 {
            return Err(ConfigError::invalid("transform.num_labels", "must be positive"));
        }
        // room for <s> and </s>
        if self.transform.max_seq_len < 2 {
            return Err(ConfigError::invalid("transform.max_seq_len", "must be at least 2"));
        }
        if !self.columns.contains(&self.label_column) {
            return Err(ConfigError::invalid(
                "label_column",
                format!("{} is not one of {:?}", self.label_column, self.columns),
            ));
        }
        if self.text_column().is_none() {
            return Err(ConfigError::invalid("columns", "need a text column besides the label"));
        }
        if let Some(names) = &self.transform.label_names {
            if names.len() != self.transform.num_labels {
                return Err(ConfigError::invalid(
                    "transform.label_names",
                    format!("{} names for {} labels", names.len(), self.transform.num_labels),
                ));
            }
        }
        Ok(())
    }

    /// Position of the label column in a labeled row.
    pub fn label_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| *c == self.label_column)
    }

    /// Position of the text column: the first column that is not the label.
    pub fn text_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| *c != self.label_column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DocClassificationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.label_index(), Some(1));
        assert_eq!(config.text_column(), Some(0));
        assert_eq!(config.transform.max_seq_len, 256);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
batch_size = 8
columns = ["label", "text"]

[dataset]
root = "/srv/glue"

[transform]
vocab_path = "/srv/vocab.txt"
tokenizer_path = "/srv/tokenizer.json"
num_labels = 2
label_names = ["negative", "positive"]
"#
        )
        .unwrap();

        let config = DocClassificationConfig::load(Some(file.path()), &[]).unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.label_index(), Some(0));
        assert_eq!(config.text_column(), Some(1));
        assert_eq!(config.dataset.root, PathBuf::from("/srv/glue"));
        assert_eq!(
            config.transform.tokenizer_path,
            Some(PathBuf::from("/srv/tokenizer.json"))
        );
    }

    #[test]
    fn test_label_names_must_match_count() {
        let mut config = DocClassificationConfig::default();
        config.transform.label_names = Some(vec!["only".into()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_label_column_must_be_listed() {
        let config = DocClassificationConfig {
            label_column: "sentiment".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
