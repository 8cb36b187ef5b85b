//! Utility modules for the snapshot runner.

pub mod errors;
pub mod logger;

pub use errors::{Result, RunnerError};
