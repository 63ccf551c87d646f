//! Launch defaults against the real process environment.
//!
//! Lives in its own test binary: it mutates the process environment.

#![cfg(unix)]

use recipes_core::error::EnvError;
use recipes_core::{LaunchEnv, launch};
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

#[test]
fn test_non_utf8_value_is_kept_and_rejected() {
    let raw = OsString::from_vec(b"3\xFF".to_vec());
    // SAFETY: the only test in this binary, nothing else reads the environment concurrently.
    unsafe { std::env::set_var(launch::MASTER_ADDR, &raw) };

    let applied = launch::set_env();
    assert!(!applied.contains(&launch::MASTER_ADDR));
    assert_eq!(std::env::var_os(launch::MASTER_ADDR), Some(raw));

    match LaunchEnv::from_process() {
        Err(EnvError::NotUnicode { name }) => assert_eq!(name, launch::MASTER_ADDR),
        other => panic!("expected a non-UTF-8 error, got {other:?}"),
    }

    unsafe { std::env::remove_var(launch::MASTER_ADDR) };
    let env = LaunchEnv::from_process().unwrap();
    assert_eq!(env.master_addr, "localhost");
}
