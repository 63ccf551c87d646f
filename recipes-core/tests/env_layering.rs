//! Environment overrides sit between the file and `--set`.
//!
//! Lives in its own test binary: it mutates the process environment.

use pretty_assertions::assert_eq;
use recipes_core::RunConfig;
use std::path::PathBuf;

#[test]
fn test_env_beats_file_and_cli_beats_env() {
    let file = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../config/charnn.toml");
    // SAFETY: the only test in this binary, nothing else reads the environment concurrently.
    unsafe {
        std::env::set_var("CHARNN_TRAINER__MAX_EPOCHS", "7");
        std::env::set_var("CHARNN_TRAINER__BATCH_SIZE", "4");
    }

    let config = RunConfig::load(Some(&file), &["trainer.batch_size=2".to_string()]).unwrap();
    assert_eq!(config.trainer.max_epochs, 7);
    assert_eq!(config.trainer.batch_size, 2);

    unsafe {
        std::env::remove_var("CHARNN_TRAINER__MAX_EPOCHS");
        std::env::remove_var("CHARNN_TRAINER__BATCH_SIZE");
    }
}
