//! Snapshot Runner Library
//!
//! Crash-safe incremental snapshots: each run copies a source tree into a
//! new timestamped directory, hard-linking files unchanged since the last
//! complete snapshot.

pub mod chain;
pub mod config;
pub mod daemon;
pub mod lock;
pub mod mount;
pub mod recovery;
pub mod retention;
pub mod runner;
pub mod snapshot;
pub mod status;
pub mod supervisor;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, Job};
pub use utils::errors::RunnerError;
pub type Result<T> = std::result::Result<T, RunnerError>;
