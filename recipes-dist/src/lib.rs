//! # recipes-dist
//!
//! Distributed plumbing for the recipes: a TCP process group with blocking
//! collectives, the communication backend chosen from the selected device,
//! and the data-parallel wrapper that keeps replicas in sync.

pub mod backend;
pub mod ddp;
pub mod group;
pub mod wire;

pub use backend::Backend;
pub use ddp::DistributedDataParallel;
pub use group::ProcessGroup;
