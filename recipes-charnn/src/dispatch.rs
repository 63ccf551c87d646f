//! Task selection: train the model or generate a completion.

use crate::checkpoint::Checkpoint;
use crate::dataset::{CharDataset, Subset};
use crate::model::{Gpt, LanguageModel};
use crate::sampler::{SamplingConfig, sample};
use crate::trainer::{EpochReport, Trainer, TrainerConfig};
use candle_core::Device;
use candle_nn::AdamW;
use rand::SeedableRng;
use rand::rngs::StdRng;
use recipes_core::Result;
use recipes_core::RunConfig;
use recipes_core::config::CharnnConfig;
use recipes_core::error::ConfigError;
use recipes_dist::DistributedDataParallel;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Train,
    Generate,
}

impl FromStr for Task {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Task::Train),
            "generate" => Ok(Task::Generate),
            other => Err(ConfigError::UnknownTask {
                task: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Train => write!(f, "train"),
            Task::Generate => write!(f, "generate"),
        }
    }
}

/// First epoch to run: the one after the checkpoint's, or 0.
pub fn start_epoch(checkpoint: Option<&Checkpoint>) -> usize {
    checkpoint.map_or(0, |c| c.meta.finished_epoch + 1)
}

/// What a dispatched task produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Trained(Vec<EpochReport>),
    /// The completion on rank 0; `None` on every other rank.
    Generated(Option<String>),
}

/// Everything a task needs once the model is built.
pub struct Prepared {
    pub model: DistributedDataParallel<Gpt>,
    pub optimizer: AdamW,
    pub train: Subset,
    pub test: Subset,
    pub job_name: String,
    pub start_epoch: usize,
}

pub async fn dispatch<W: Write>(
    task: Task,
    config: &RunConfig,
    prepared: Prepared,
    out: &mut W,
) -> Result<Outcome> {
    match task {
        Task::Train => {
            let trainer_config =
                TrainerConfig::from_section(prepared.job_name, &config.trainer, config.seed);
            let mut trainer = Trainer::new(
                prepared.model,
                prepared.optimizer,
                prepared.train,
                prepared.test,
                trainer_config,
                prepared.start_epoch,
            );
            let reports = trainer.fit(config.max_iter).await?;
            Ok(Outcome::Trained(reports))
        }
        Task::Generate => {
            let rank = prepared.model.group().rank();
            let completion = generate_seq(
                &config.charnn,
                &prepared.model,
                prepared.train.dataset(),
                rank,
                config.seed,
                prepared.model.device(),
                out,
            )?;
            Ok(Outcome::Generated(completion))
        }
    }
}

/// Complete `charnn.phrase` and write the result to `out`. Only rank 0
/// generates.
pub fn generate_seq<M: LanguageModel, W: Write>(
    config: &CharnnConfig,
    model: &M,
    dataset: &CharDataset,
    rank: usize,
    seed: u64,
    device: &Device,
    out: &mut W,
) -> Result<Option<String>> {
    if rank != 0 {
        return Ok(None);
    }
    let context = dataset.encode(&config.phrase)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let indices = sample(
        model,
        &context,
        SamplingConfig::from_charnn(config),
        &mut rng,
        device,
    )?;
    let completion = dataset.decode(&indices);
    writeln!(out, "{completion}")?;
    info!(
        phrase = %config.phrase,
        new_symbols = indices.len() - context.len(),
        "Generated completion"
    );
    Ok(Some(completion))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointMeta;
    use crate::dataset::memory_source;
    use crate::model::GptConfig;
    use candle_core::Tensor;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use recipes_core::RecipeError;
    use recipes_core::error::DatasetError;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Uniform logits over the vocabulary.
    struct Uniform(usize);

    impl LanguageModel for Uniform {
        fn block_size(&self) -> usize {
            8
        }

        fn vocab_size(&self) -> usize {
            self.0
        }

        fn forward(&self, idx: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
            let (b, t) = idx.dims2()?;
            Tensor::zeros((b, t, self.0), candle_core::DType::F32, idx.device())
        }
    }

    fn checkpoint(finished_epoch: usize) -> Checkpoint {
        Checkpoint {
            meta: CheckpointMeta {
                finished_epoch,
                job_name: "job".into(),
                saved_at: Utc::now(),
                weights_file: String::new(),
                weights_sha256: String::new(),
                model: GptConfig {
                    vocab_size: 2,
                    block_size: 2,
                    n_layer: 1,
                    n_head: 1,
                    n_embd: 2,
                    embd_pdrop: 0.0,
                    resid_pdrop: 0.0,
                    attn_pdrop: 0.0,
                },
            },
            weights: HashMap::new(),
            dir: PathBuf::from("ckpt"),
        }
    }

    fn generate_config(phrase: &str) -> CharnnConfig {
        CharnnConfig {
            task: "generate".into(),
            phrase: phrase.into(),
            max_new_tokens: 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_task_parsing() {
        assert_eq!("train".parse::<Task>().unwrap(), Task::Train);
        assert_eq!("generate".parse::<Task>().unwrap(), Task::Generate);
        let err = "explode".parse::<Task>().unwrap_err();
        assert!(err.to_string().contains("explode"));
    }

    #[test]
    fn test_start_epoch() {
        assert_eq!(start_epoch(None), 0);
        assert_eq!(start_epoch(Some(&checkpoint(0))), 1);
        assert_eq!(start_epoch(Some(&checkpoint(4))), 5);
    }

    #[test]
    fn test_generate_writes_completion_on_rank_zero() {
        let dataset = CharDataset::from_text("hello there, general", 4, &memory_source()).unwrap();
        let model = Uniform(dataset.vocab_size());
        let mut out = Vec::new();
        let completion = generate_seq(
            &generate_config("hello"),
            &model,
            &dataset,
            0,
            42,
            &Device::Cpu,
            &mut out,
        )
        .unwrap()
        .unwrap();

        assert!(completion.starts_with("hello"));
        assert_eq!(completion.chars().count(), 5 + 30);
        assert!(completion.chars().all(|c| dataset.stoi().contains_key(&c)));
        assert_eq!(String::from_utf8(out).unwrap(), format!("{completion}\n"));
    }

    #[test]
    fn test_other_ranks_stay_silent() {
        let dataset = CharDataset::from_text("hello there", 4, &memory_source()).unwrap();
        let mut out = Vec::new();
        let result = generate_seq(
            &generate_config("hello"),
            &Uniform(dataset.vocab_size()),
            &dataset,
            1,
            42,
            &Device::Cpu,
            &mut out,
        )
        .unwrap();
        assert!(result.is_none());
        assert!(out.is_empty());
    }

    #[test]
    fn test_phrase_outside_vocabulary() {
        let dataset = CharDataset::from_text("abcabcabc", 4, &memory_source()).unwrap();
        let err = generate_seq(
            &generate_config("abz"),
            &Uniform(dataset.vocab_size()),
            &dataset,
            0,
            42,
            &Device::Cpu,
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RecipeError::Dataset(DatasetError::UnknownSymbol { symbol: 'z' })
        ));
    }
}
