//! Custom error types for the snapshot runner.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

use crate::lock::LockRecord;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job ID '{0}': only letters, digits and '_' are allowed")]
    InvalidJobId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {}: {source}", .path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job '{job_id}' is already running{}", holder_suffix(.holder))]
    LockHeld {
        job_id: String,
        holder: Option<LockRecord>,
    },

    #[error("Snapshot directory {} is not empty", .0.display())]
    TargetNotEmpty(PathBuf),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Transfer exited with {0}")]
    TransferStatus(ExitStatus),

    #[error("Failed to remove sentinel {}: {source}", .path.display())]
    SentinelRemoval {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run interrupted by shutdown signal")]
    Interrupted,

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RunnerError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunnerError::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error. Every fatal condition maps to 1.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<config::ConfigError> for RunnerError {
    fn from(err: config::ConfigError) -> Self {
        RunnerError::Config(err.to_string())
    }
}

fn holder_suffix(holder: &Option<LockRecord>) -> String {
    match holder {
        Some(record) => format!(
            " (pid {} on {}, since {})",
            record.pid,
            record.hostname,
            record.started_at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
