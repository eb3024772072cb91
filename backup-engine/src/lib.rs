//! Volume backup engine.
//!
//! Backs up container volumes and application configuration to
//! S3-compatible storage, either as archives under a commit marker or as
//! deduplicated restic snapshots, and restores them with rollback.

pub mod apps;
pub mod archive;
pub mod config;
pub mod executor;
pub mod jobs;
pub mod process;
pub mod repository;
pub mod retention;
pub mod rollback;
pub mod runtime;
pub mod scheduled;
pub mod snapshot;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{EngineError, Result};
