//! # recipes-charnn
//!
//! The character-level GPT recipe: a corpus split into overlapping windows,
//! a minGPT-style model wrapped for data-parallel training, a checkpointing
//! trainer and an autoregressive sampler, tied together by [`recipe::run`].

pub mod builder;
pub mod checkpoint;
pub mod dataset;
pub mod dispatch;
pub mod loader;
pub mod model;
pub mod profile;
pub mod recipe;
pub mod sampler;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointMeta};
pub use dataset::CharDataset;
pub use dispatch::{Outcome, Task};
pub use model::{Gpt, GptConfig, LanguageModel};
pub use recipe::{run, run_with_output};
pub use trainer::{EpochReport, Trainer, TrainerConfig};
