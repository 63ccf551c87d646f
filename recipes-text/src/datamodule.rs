//! Batched access to the train, validation and test splits.

use crate::config::DocClassificationConfig;
use crate::sst2::{ColumnLayout, RawExample, Split, read_split};
use crate::transform::{DocClassificationTextTransform, LabelTransform, TextTokenizer};
use candle_core::{Device, Tensor};
use recipes_core::Result;
use recipes_core::config::resolve_path;
use recipes_core::error::{ConfigError, DatasetError};
use std::sync::Arc;
use tracing::info;

/// A transformed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub token_ids: Vec<u32>,
    pub label_id: Option<u32>,
}

/// Token ids shaped `(batch, longest row)` padded with `<pad>`, and label
/// ids shaped `(batch,)` when the split is labeled.
#[derive(Debug, Clone)]
pub struct DocBatch {
    pub token_ids: Tensor,
    pub label_ids: Option<Tensor>,
    split: Split,
}

impl DocBatch {
    pub fn labels(&self) -> Result<&Tensor> {
        self.label_ids.as_ref().ok_or_else(|| {
            DatasetError::Unlabeled {
                split: self.split.to_string(),
            }
            .into()
        })
    }
}

pub struct DocClassificationDataModule {
    train: Arc<Vec<Example>>,
    val: Arc<Vec<Example>>,
    test: Arc<Vec<Example>>,
    batch_size: usize,
    pad_id: u32,
    device: Device,
}

impl DocClassificationDataModule {
    /// Read and transform every split described by `config`.
    pub fn from_config(config: &DocClassificationConfig) -> Result<Self> {
        config.validate()?;
        let layout = ColumnLayout {
            text: config
                .text_column()
                .ok_or_else(|| ConfigError::invalid("columns", "no text column"))?,
            label: config
                .label_index()
                .ok_or_else(|| ConfigError::invalid("label_column", "not among columns"))?,
            width: config.columns.len(),
        };

        let tokenizer = TextTokenizer::from_config(&config.transform)?;
        let pad_id = tokenizer.pad_id();
        let text = DocClassificationTextTransform::new(tokenizer, config.transform.max_seq_len);
        let labels = LabelTransform::new(
            config.transform.num_labels,
            config.transform.label_names.clone(),
        );

        let root = resolve_path(&config.dataset.root);
        let load = |split: Split| -> Result<Arc<Vec<Example>>> {
            let rows = read_split(&root, split, layout)?;
            Ok(Arc::new(transform_rows(&rows, &text, &labels)?))
        };
        let train = load(Split::Train)?;
        let val = load(Split::Dev)?;
        let test = load(Split::Test)?;
        info!(
            train = train.len(),
            val = val.len(),
            test = test.len(),
            batch_size = config.batch_size,
            "Document classification data ready"
        );

        Ok(Self {
            train,
            val,
            test,
            batch_size: config.batch_size,
            pad_id,
            device: Device::Cpu,
        })
    }

    /// Place batches on `device` instead of host memory.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn train_dataloader(&self) -> DocBatches {
        self.batches(&self.train, Split::Train)
    }

    pub fn val_dataloader(&self) -> DocBatches {
        self.batches(&self.val, Split::Dev)
    }

    pub fn test_dataloader(&self) -> DocBatches {
        self.batches(&self.test, Split::Test)
    }

    fn batches(&self, examples: &Arc<Vec<Example>>, split: Split) -> DocBatches {
        DocBatches {
            examples: examples.clone(),
            next: 0,
            batch_size: self.batch_size,
            pad_id: self.pad_id,
            split,
            device: self.device.clone(),
        }
    }
}

fn transform_rows(
    rows: &[RawExample],
    text: &DocClassificationTextTransform,
    labels: &LabelTransform,
) -> Result<Vec<Example>, DatasetError> {
    rows.iter()
        .map(|row| {
            Ok(Example {
                token_ids: text.encode(&row.text)?,
                label_id: row.label.as_deref().map(|l| labels.encode(l)).transpose()?,
            })
        })
        .collect()
}

/// Batches of one split in file order.
pub struct DocBatches {
    examples: Arc<Vec<Example>>,
    next: usize,
    batch_size: usize,
    pad_id: u32,
    split: Split,
    device: Device,
}

impl DocBatches {
    pub fn len(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

impl Iterator for DocBatches {
    type Item = Result<DocBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.examples.len() {
            return None;
        }
        let end = (self.next + self.batch_size).min(self.examples.len());
        let rows = &self.examples[self.next..end];
        self.next = end;
        Some(collate(rows, self.pad_id, self.split, &self.device))
    }
}

/// Pad rows to the longest one and stack them.
pub fn collate(rows: &[Example], pad_id: u32, split: Split, device: &Device) -> Result<DocBatch> {
    let longest = rows.iter().map(|r| r.token_ids.len()).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * longest);
    for row in rows {
        flat.extend_from_slice(&row.token_ids);
        flat.extend(std::iter::repeat_n(pad_id, longest - row.token_ids.len()));
    }
    let token_ids = Tensor::from_vec(flat, (rows.len(), longest), device)?;

    let label_ids = rows
        .iter()
        .map(|r| r.label_id)
        .collect::<Option<Vec<u32>>>()
        .map(|labels| Tensor::from_vec(labels, rows.len(), device))
        .transpose()?;

    Ok(DocBatch {
        token_ids,
        label_ids,
        split,
    })
}
