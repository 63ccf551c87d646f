//! Whole-recipe runs on a tiny corpus in a single process.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use recipes_charnn::checkpoint::{load_checkpoint, save_checkpoint};
use recipes_charnn::trainer::METRICS_FILE;
use recipes_charnn::{EpochReport, Gpt, GptConfig, Outcome, run_with_output};
use recipes_core::error::ConfigError;
use recipes_core::{LaunchEnv, RecipeError, RunConfig};
use std::path::Path;
use tempfile::TempDir;

const CORPUS: &str = "Hello there! General Kenobi. You are a bold one. Hello there, hello again.\n";

fn single_process() -> LaunchEnv {
    LaunchEnv::from_lookup(|name| match name {
        "TORCHELASTIC_RUN_ID" => Some("e2e0test-1111".to_string()),
        _ => None,
    })
    .unwrap()
}

fn tiny_config(dir: &Path) -> RunConfig {
    let corpus = dir.join("input.txt");
    std::fs::write(&corpus, CORPUS.repeat(4)).unwrap();

    let mut config = RunConfig::default();
    config.dataset.path = corpus;
    config.model.n_layer = 1;
    config.model.n_head = 2;
    config.model.n_embd = 8;
    config.model.block_size = 8;
    config.trainer.batch_size = 4;
    config.trainer.log_every = 1;
    config.charnn.max_new_tokens = 40;
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn test_generate_completes_the_phrase() {
    let dir = TempDir::new().unwrap();
    let mut config = tiny_config(dir.path());
    config.charnn.task = "generate".into();
    config.charnn.phrase = "Hello".into();

    let mut out = Vec::new();
    let outcome = run_with_output(&config, &single_process(), &mut out)
        .await
        .unwrap();

    let printed = String::from_utf8(out).unwrap();
    let completion = printed.strip_suffix('\n').unwrap();
    assert!(completion.starts_with("Hello"));
    assert_eq!(completion.chars().count(), "Hello".len() + 40);
    assert!(completion.chars().all(|c| CORPUS.contains(c)));
    assert_eq!(outcome, Outcome::Generated(Some(completion.to_string())));
}

#[tokio::test]
async fn test_unknown_task_fails_before_any_work() {
    let dir = TempDir::new().unwrap();
    let mut config = tiny_config(dir.path());
    config.charnn.task = "explode".into();
    // a missing corpus would fail later; the task is rejected first
    config.dataset.path = dir.path().join("missing.txt");

    let mut out = Vec::new();
    let err = run_with_output(&config, &single_process(), &mut out)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RecipeError::Config(ConfigError::UnknownTask { ref task }) if task == "explode"
    ));
    assert!(err.to_string().contains("explode"));
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_training_resumes_after_checkpointed_epoch() {
    let dir = TempDir::new().unwrap();
    let checkpoint_dir = dir.path().join("ckpt");
    let log_dir = dir.path().join("logs");
    let mut config = tiny_config(dir.path());
    config.trainer.max_epochs = 6;
    config.trainer.checkpoint_path = Some(checkpoint_dir.clone());
    config.trainer.log_dir = Some(log_dir.clone());
    config.trainer.enable_profile = true;
    config.max_iter = Some(2);

    // a checkpoint whose last finished epoch is 4
    let vocab: std::collections::BTreeSet<char> = CORPUS.chars().collect();
    let model_config = GptConfig::new(vocab.len(), 8, &config.model);
    let varmap = VarMap::new();
    Gpt::new(
        &model_config,
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
    )
    .unwrap();
    save_checkpoint(&checkpoint_dir, &varmap, 4, "earlier-job", &model_config).unwrap();

    let env = single_process();
    let outcome = run_with_output(&config, &env, &mut Vec::new()).await.unwrap();
    let Outcome::Trained(reports) = outcome else {
        panic!("expected a training outcome");
    };
    let epochs: Vec<usize> = reports.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![5]);
    assert_eq!(reports[0].iterations, 2);
    assert!(reports[0].train_loss.is_finite());

    let saved = load_checkpoint(Some(&checkpoint_dir)).unwrap().unwrap();
    assert_eq!(saved.meta.finished_epoch, 5);
    assert_eq!(saved.meta.job_name, env.job_name());

    let run_dir = log_dir.join(env.job_name());
    let metrics = std::fs::read_to_string(run_dir.join(METRICS_FILE)).unwrap();
    let lines: Vec<EpochReport> = metrics
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].epoch, 5);
    assert!(run_dir.join("profile.json").exists());
}

#[tokio::test]
async fn test_finished_run_trains_nothing() {
    let dir = TempDir::new().unwrap();
    let checkpoint_dir = dir.path().join("ckpt");
    let mut config = tiny_config(dir.path());
    config.trainer.max_epochs = 1;
    config.trainer.checkpoint_path = Some(checkpoint_dir.clone());
    config.max_iter = Some(1);

    let env = single_process();
    let first = run_with_output(&config, &env, &mut Vec::new()).await.unwrap();
    assert!(matches!(first, Outcome::Trained(ref r) if r.len() == 1));
    assert_eq!(
        load_checkpoint(Some(&checkpoint_dir))
            .unwrap()
            .unwrap()
            .meta
            .finished_epoch,
        0
    );

    let second = run_with_output(&config, &env, &mut Vec::new()).await.unwrap();
    assert_eq!(second, Outcome::Trained(Vec::new()));
}
