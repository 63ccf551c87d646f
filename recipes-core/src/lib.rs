//! # recipes-core
//!
//! Shared foundation for the training recipes: the error taxonomy, layered
//! run configuration, the launch environment of a distributed run, device
//! selection and atomic persistence helpers.

pub mod config;
pub mod device;
pub mod error;
pub mod launch;
pub mod persistence;

pub use config::RunConfig;
pub use device::DeviceHandle;
pub use error::{RecipeError, Result};
pub use launch::LaunchEnv;
