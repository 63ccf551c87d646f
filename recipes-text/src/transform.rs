//! Text and label transforms.
//!
//! Text goes through a `tokenizers` pipeline. It is either loaded from a
//! serialized `tokenizer.json`, or built as a word-level model over a
//! one-token-per-line vocabulary with lowercasing and BERT-style
//! whitespace/punctuation splitting.

use crate::config::TransformConfig;
use recipes_core::Result;
use recipes_core::config::resolve_path;
use recipes_core::error::DatasetError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::normalizers::Lowercase;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::{ModelWrapper, Tokenizer};

pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";
pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";

/// A tokenizer plus the ids of the special tokens the transform frames
/// and pads with.
#[derive(Clone)]
pub struct TextTokenizer {
    inner: Tokenizer,
    source: PathBuf,
    pad_id: u32,
    bos_id: u32,
    eos_id: u32,
}

impl std::fmt::Debug for TextTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextTokenizer")
            .field("source", &self.source)
            .field("vocab_size", &self.vocab_size())
            .field("pad_id", &self.pad_id)
            .finish()
    }
}

impl TextTokenizer {
    /// `tokenizer_path` when configured, the vocabulary file otherwise.
    pub fn from_config(config: &TransformConfig) -> Result<Self> {
        let tokenizer = match &config.tokenizer_path {
            Some(path) => Self::from_tokenizer_file(&resolve_path(path))?,
            None => Self::from_vocab_file(&resolve_path(&config.vocab_path))?,
        };
        tracing::info!(
            path = %tokenizer.source.display(),
            vocab_size = tokenizer.vocab_size(),
            "Loaded tokenizer"
        );
        Ok(tokenizer)
    }

    /// Load a serialized `tokenizer.json`.
    pub fn from_tokenizer_file(path: &Path) -> Result<Self, DatasetError> {
        let inner = Tokenizer::from_file(path).map_err(|e| tokenizer_error(path, e))?;
        Self::with_special_tokens(inner, path)
    }

    pub fn from_vocab_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_vocab(text.lines().map(str::to_string), path)?)
    }

    /// Word-level tokenizer over tokens in id order. `source` only labels
    /// errors. Unknown words map to `<unk>`, which must be present.
    pub fn from_vocab<I>(tokens: I, source: &Path) -> Result<Self, DatasetError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut vocab: HashMap<String, u32> = HashMap::new();
        for (i, token) in tokens.into_iter().enumerate() {
            // first occurrence wins
            vocab.entry(token).or_insert(i as u32);
        }
        if !vocab.contains_key(UNK_TOKEN) {
            return Err(missing_special(source, UNK_TOKEN));
        }

        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token(UNK_TOKEN.to_string())
            .build()
            .map_err(|e| tokenizer_error(source, e))?;
        let mut inner = Tokenizer::new(ModelWrapper::WordLevel(model));
        inner
            .with_normalizer(Some(Lowercase))
            .with_pre_tokenizer(Some(BertPreTokenizer));
        Self::with_special_tokens(inner, source)
    }

    fn with_special_tokens(inner: Tokenizer, source: &Path) -> Result<Self, DatasetError> {
        let special = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| missing_special(source, token))
        };
        let pad_id = special(PAD_TOKEN)?;
        let bos_id = special(BOS_TOKEN)?;
        let eos_id = special(EOS_TOKEN)?;
        Ok(Self {
            inner,
            source: source.to_path_buf(),
            pad_id,
            bos_id,
            eos_id,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    /// Token ids of `text` without framing.
    pub fn encode_words(&self, text: &str) -> Result<Vec<u32>, DatasetError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| tokenizer_error(&self.source, e))?;
        Ok(encoding.get_ids().to_vec())
    }
}

fn missing_special(source: &Path, token: &str) -> DatasetError {
    DatasetError::MissingSpecialToken {
        path: source.to_path_buf(),
        token: token.to_string(),
    }
}

fn tokenizer_error(path: &Path, err: impl std::fmt::Display) -> DatasetError {
    DatasetError::Tokenizer {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Maps raw text to token ids framed by `<s>` and `</s>`.
#[derive(Debug, Clone)]
pub struct DocClassificationTextTransform {
    tokenizer: TextTokenizer,
    max_seq_len: usize,
}

impl DocClassificationTextTransform {
    pub fn new(tokenizer: TextTokenizer, max_seq_len: usize) -> Self {
        Self {
            tokenizer,
            max_seq_len,
        }
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    /// Token ids, at most `max_seq_len` long. Truncation keeps the leading
    /// tokens and always ends with `</s>`.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, DatasetError> {
        let body = self.max_seq_len.saturating_sub(2);
        let words = self.tokenizer.encode_words(text)?;
        let mut ids = Vec::with_capacity(words.len().min(body) + 2);
        ids.push(self.tokenizer.bos_id);
        ids.extend(words.into_iter().take(body));
        ids.push(self.tokenizer.eos_id);
        Ok(ids)
    }
}

/// Maps label strings to ids in `0..num_labels`.
#[derive(Debug, Clone)]
pub struct LabelTransform {
    num_labels: usize,
    names: Option<Vec<String>>,
}

impl LabelTransform {
    pub fn new(num_labels: usize, names: Option<Vec<String>>) -> Self {
        Self { num_labels, names }
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn encode(&self, label: &str) -> Result<u32, DatasetError> {
        let label = label.trim();
        let id = match &self.names {
            Some(names) => names
                .iter()
                .position(|n| n == label)
                .ok_or_else(|| DatasetError::UnknownLabel {
                    label: label.to_string(),
                })?,
            None => label.parse::<usize>().map_err(|_| DatasetError::UnknownLabel {
                label: label.to_string(),
            })?,
        };
        if id >= self.num_labels {
            return Err(DatasetError::LabelOutOfRange {
                label: id,
                num_labels: self.num_labels,
            });
        }
        Ok(id as u32)
    }
}
