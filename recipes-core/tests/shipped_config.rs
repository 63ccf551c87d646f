//! The configuration shipped in `config/` loads and validates.

use pretty_assertions::assert_eq;
use recipes_core::RunConfig;
use std::path::PathBuf;

fn shipped(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../config")
        .join(name)
}

#[test]
fn test_charnn_toml_matches_defaults() {
    let config = RunConfig::load(Some(&shipped("charnn.toml")), &[]).unwrap();
    let defaults = RunConfig::default();
    assert_eq!(config.model, defaults.model);
    assert_eq!(config.opt, defaults.opt);
    assert_eq!(config.charnn, defaults.charnn);
    assert_eq!(config.trainer.max_epochs, 10);
    assert_eq!(config.trainer.checkpoint_path, Some(PathBuf::from("checkpoints/charnn")));
}

#[test]
fn test_cli_override_beats_file() {
    let config = RunConfig::load(
        Some(&shipped("charnn.toml")),
        &["charnn.task=generate".to_string(), "max_iter=3".to_string()],
    )
    .unwrap();
    assert_eq!(config.charnn.task, "generate");
    assert_eq!(config.max_iter, Some(3));
}
