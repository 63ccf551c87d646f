//! # recipes-text
//!
//! Document classification data: SST-2 style TSV splits, a `tokenizers`
//! text transform and padded, batched tensors.

pub mod config;
pub mod datamodule;
pub mod sst2;
pub mod transform;

pub use config::DocClassificationConfig;
pub use datamodule::{DocBatch, DocClassificationDataModule};
pub use transform::TextTokenizer;
