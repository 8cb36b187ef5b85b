//! Configuration management for the snapshot runner.
//!
//! One TOML file per job, layered with `SNAPSHOT_RUNNER_*` environment
//! variables (`SNAPSHOT_RUNNER_RETENTION__RETAIN=7`). The loaded
//! [`Config`] is validated once into an immutable [`Job`] that the rest of
//! the crate receives by reference.

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::retention::RetentionPolicy;
use crate::utils::{Result, RunnerError};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SNAPSHOT_RUNNER";

/// Directory searched for `<job_id>.toml` when no file is given.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/snapshot-runner";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: JobConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// What to back up: a local path or `host:path`
    pub source: String,

    /// Root under which `<job_id>/` holds the snapshots
    pub target_root: PathBuf,

    /// Transfer log directory (default: `<target_root>/.logs/<job_id>`)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Exclusion patterns passed to the transfer
    #[serde(default)]
    pub exclude: Vec<String>,

    /// File holding one exclusion pattern per line
    #[serde(default)]
    pub exclude_from: Option<PathBuf>,

    /// Remote shell for `host:path` sources, e.g. `ssh -i /root/.ssh/backup`
    #[serde(default)]
    pub remote_shell: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Run the cleanup sweeps after each transfer
    #[serde(default)]
    pub auto_clean: bool,

    /// Complete snapshots and logs to keep (0 or unset disables rotation)
    #[serde(default)]
    pub retain: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Runtime-state directory holding `<job_id>.lock`
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Transfer program speaking the rsync argument dialect
    #[serde(default = "default_transfer_program")]
    pub program: PathBuf,

    /// Extra arguments appended after the built-in flags
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount the backup storage for the duration of the run
    #[serde(default)]
    pub enabled: bool,

    /// Mount command as an argument vector
    #[serde(default)]
    pub mount: Vec<String>,

    /// Unmount command as an argument vector
    #[serde(default)]
    pub unmount: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_lock_dir() -> PathBuf {
    PathBuf::from("/run/snapshot-runner")
}

fn default_transfer_program() -> PathBuf {
    PathBuf::from("rsync")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            program: default_transfer_program(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file plus environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(RunnerError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }
        Self::build(File::from(path).format(FileFormat::Toml).required(true))
    }

    /// Load configuration from TOML text plus environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::build(File::from_str(content, FileFormat::Toml))
    }

    fn build<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder()
            .add_source(source)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Default file for a job: `/etc/snapshot-runner/<job_id>.toml`.
    pub fn default_path(job_id: &str) -> PathBuf {
        Path::new(DEFAULT_CONFIG_DIR).join(format!("{job_id}.toml"))
    }

    /// Applies command-line retention flags on top of the file values.
    pub fn with_overrides(mut self, auto_clean: bool, retain: Option<u32>) -> Self {
        if auto_clean {
            self.retention.auto_clean = true;
        }
        if retain.is_some() {
            self.retention.retain = retain;
        }
        self
    }
}

/// Validated, immutable description of one job's run.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source: String,
    /// `<target_root>/<id>`: the snapshot directories live here.
    pub job_folder: PathBuf,
    pub log_dir: PathBuf,
    pub excludes: Vec<String>,
    pub exclude_from: Option<PathBuf>,
    pub remote_shell: Option<String>,
    pub retention: RetentionPolicy,
    pub lock_dir: PathBuf,
    pub transfer_program: PathBuf,
    pub transfer_args: Vec<String>,
    pub mount: MountConfig,
}

impl Job {
    /// Validates `config` for `job_id`.
    pub fn from_config(job_id: &str, config: &Config) -> Result<Self> {
        validate_job_id(job_id)?;

        let job = &config.job;
        if job.source.trim().is_empty() {
            return Err(RunnerError::Config("job.source is required".into()));
        }
        if job.target_root.as_os_str().is_empty() {
            return Err(RunnerError::Config("job.target_root is required".into()));
        }
        if config.transfer.program.as_os_str().is_empty() {
            return Err(RunnerError::Config("transfer.program must not be empty".into()));
        }
        if config.mount.enabled && (config.mount.mount.is_empty() || config.mount.unmount.is_empty()) {
            return Err(RunnerError::Config(
                "mount.enabled requires both mount and unmount commands".into(),
            ));
        }

        let log_dir = job
            .log_dir
            .clone()
            .unwrap_or_else(|| job.target_root.join(".logs").join(job_id));

        Ok(Self {
            id: job_id.to_string(),
            source: job.source.clone(),
            job_folder: job.target_root.join(job_id),
            log_dir,
            excludes: job.exclude.clone(),
            exclude_from: job.exclude_from.clone(),
            remote_shell: job.remote_shell.clone().filter(|s| !s.trim().is_empty()),
            retention: RetentionPolicy {
                auto_clean: config.retention.auto_clean,
                retain: config.retention.retain,
            },
            lock_dir: config.lock.dir.clone(),
            transfer_program: config.transfer.program.clone(),
            transfer_args: config.transfer.extra_args.clone(),
            mount: config.mount.clone(),
        })
    }
}

/// Job identifiers are non-empty and limited to ASCII letters, digits and `_`.
pub fn validate_job_id(job_id: &str) -> Result<()> {
    let valid = !job_id.is_empty() && job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RunnerError::InvalidJobId(job_id.to_string()))
    }
}
