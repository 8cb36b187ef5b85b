//! Snapshot lifecycle for a single run.
//!
//! ```text
//! CREATED -> IN_PROGRESS -> SUCCESS
//!                        -> FAILED  (snapshot directory deleted)
//! ```
//!
//! The sentinel is written before the transfer starts and removed only after
//! it exits successfully, so any termination in between leaves a snapshot
//! that every later scan recognises as incomplete.

use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Job;
use crate::retention::LOG_EXTENSION;
use crate::snapshot::{self, Snapshot, SnapshotName};
use crate::transfer::{self, TransferCommand};
use crate::utils::{Result, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    InProgress,
    Success,
    Failed,
}

/// The snapshot a run is producing.
#[derive(Debug)]
pub struct SnapshotRun<'a> {
    job: &'a Job,
    name: SnapshotName,
    path: PathBuf,
    link_source: Option<Snapshot>,
    state: RunState,
}

impl<'a> SnapshotRun<'a> {
    /// Creates the snapshot directory.
    ///
    /// An existing empty directory of the same name is reused; one with
    /// entries is a timestamp collision or leftover state and is fatal.
    pub fn create(job: &'a Job, name: SnapshotName, link_source: Option<Snapshot>) -> Result<Self> {
        fs::create_dir_all(&job.job_folder).map_err(|e| RunnerError::io_at(&job.job_folder, e))?;

        let path = job.job_folder.join(name.as_str());
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !is_empty_dir(&path)? {
                    return Err(RunnerError::TargetNotEmpty(path));
                }
            }
            Err(e) => return Err(RunnerError::io_at(&path, e)),
        }

        info!(job_id = %job.id, snapshot = %name, "Snapshot directory created");

        Ok(Self {
            job,
            name,
            path,
            link_source,
            state: RunState::Created,
        })
    }

    pub fn name(&self) -> &SnapshotName {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn link_source(&self) -> Option<&Snapshot> {
        self.link_source.as_ref()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Transfer log for this run.
    pub fn log_file(&self) -> PathBuf {
        self.job
            .log_dir
            .join(format!("{}.{LOG_EXTENSION}", self.name))
    }

    /// Writes the sentinel. Must happen before the transfer starts.
    ///
    /// On failure the snapshot directory is deleted: left without a
    /// sentinel it would pass for a complete snapshot.
    pub fn mark_in_progress(&mut self) -> Result<()> {
        if let Err(e) = snapshot::write_sentinel(&self.path) {
            error!(job_id = %self.job.id, snapshot = %self.name, error = %e, "Failed to write sentinel");
            self.rollback();
            return Err(e);
        }
        self.state = RunState::InProgress;
        Ok(())
    }

    /// Transfer invocation derived from the job and the resolved chain.
    pub fn transfer_command(&self) -> Result<TransferCommand> {
        let link_dest = match &self.link_source {
            Some(snap) => Some(transfer::absolute(&snap.path)?),
            None => None,
        };

        Ok(TransferCommand {
            program: self.job.transfer_program.clone(),
            source: self.job.source.clone(),
            destination: transfer::absolute(&self.path)?,
            link_dest,
            excludes: self.job.excludes.clone(),
            exclude_from: self.job.exclude_from.clone(),
            remote_shell: self.job.remote_shell.clone(),
            log_file: self.log_file(),
            extra_args: self.job.transfer_args.clone(),
        })
    }

    /// Runs the transfer and records its outcome.
    ///
    /// Success removes the sentinel; a failure to do so is fatal and leaves
    /// the snapshot in progress. Any other outcome deletes the whole
    /// snapshot directory.
    pub async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state != RunState::InProgress {
            return Err(RunnerError::Transfer(format!(
                "snapshot {} is not marked in progress",
                self.name
            )));
        }

        let outcome = match self.transfer_command() {
            Ok(command) => match command.run(cancel).await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(RunnerError::TransferStatus(status)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                snapshot::remove_sentinel(&self.path)?;
                self.state = RunState::Success;
                info!(
                    job_id = %self.job.id,
                    snapshot = %self.name,
                    link_dest = ?self.link_source.as_ref().map(|s| s.name.as_str()),
                    "Snapshot complete"
                );
                Ok(())
            }
            Err(e) => {
                error!(job_id = %self.job.id, snapshot = %self.name, error = %e, "Transfer failed");
                self.rollback();
                Err(e)
            }
        }
    }

    /// Deletes the whole snapshot directory and marks the run failed.
    pub fn rollback(&mut self) {
        self.state = RunState::Failed;
        match snapshot::discard(&self.path) {
            Ok(()) => info!(snapshot = %self.name, "Rolled back incomplete snapshot"),
            Err(e) => warn!(
                snapshot = %self.name,
                error = %e,
                "Failed to delete incomplete snapshot"
            ),
        }
    }
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path).map_err(|e| RunnerError::io_at(path, e))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Job};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn job(root: &Path, program: &Path) -> Job {
        let toml = format!(
            "[job]\nsource = \"{}\"\ntarget_root = \"{}\"\n[transfer]\nprogram = \"{}\"\n",
            root.join("src").display(),
            root.join("backup").display(),
            program.display(),
        );
        Job::from_config("unit", &Config::from_toml_str(&toml).unwrap()).unwrap()
    }

    /// Stand-in transfer: creates `payload` in the destination (last argument)
    /// and exits with `code`.
    fn script(dir: &Path, code: i32) -> PathBuf {
        let path = dir.join(format!("transfer-{code}"));
        let body = format!(
            "#!/bin/sh\nfor last; do :; done\necho data > \"$last/payload\"\nexit {code}\n"
        );
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn name(s: &str) -> SnapshotName {
        SnapshotName::parse(s).unwrap()
    }

    #[test]
    fn test_create_rejects_non_empty_target() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let job = job(temp_dir.path(), Path::new("true"));
        let existing = job.job_folder.join("20240101_000000");
        fs::create_dir_all(&existing)?;
        fs::write(existing.join("leftover"), b"x")?;

        let err = SnapshotRun::create(&job, name("20240101_000000"), None).unwrap_err();
        assert!(matches!(err, RunnerError::TargetNotEmpty(p) if p == existing));
        Ok(())
    }

    #[test]
    fn test_create_reuses_empty_target() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let job = job(temp_dir.path(), Path::new("true"));
        fs::create_dir_all(job.job_folder.join("20240101_000000"))?;

        let run = SnapshotRun::create(&job, name("20240101_000000"), None)?;
        assert_eq!(run.state(), RunState::Created);
        Ok(())
    }

    #[test]
    fn test_log_file_named_after_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let job = job(temp_dir.path(), Path::new("true"));
        let run = SnapshotRun::create(&job, name("20240101_000000"), None)?;
        assert_eq!(run.log_file(), job.log_dir.join("20240101_000000.log"));
        Ok(())
    }

    #[tokio::test]
    async fn test_success_removes_sentinel() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let program = script(temp_dir.path(), 0);
        let job = job(temp_dir.path(), &program);

        let mut run = SnapshotRun::create(&job, name("20240101_000000"), None)?;
        run.mark_in_progress()?;
        assert!(snapshot::has_sentinel(run.path()));

        run.execute(&CancellationToken::new()).await?;
        assert_eq!(run.state(), RunState::Success);
        assert!(!snapshot::has_sentinel(run.path()));
        assert!(run.path().join("payload").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_deletes_snapshot_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let program = script(temp_dir.path(), 23);
        let job = job(temp_dir.path(), &program);

        let mut run = SnapshotRun::create(&job, name("20240101_000000"), None)?;
        run.mark_in_progress()?;
        let err = run.execute(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, RunnerError::TransferStatus(s) if s.code() == Some(23)));
        assert_eq!(run.state(), RunState::Failed);
        assert!(!run.path().exists());
        assert_eq!(fs::read_dir(&job.job_folder)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_sentinel_write_failure_deletes_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let job = job(temp_dir.path(), Path::new("true"));
        let mut run = SnapshotRun::create(&job, name("20240101_000000"), None)?;
        // A directory in the sentinel's place makes creating it fail.
        fs::create_dir(snapshot::sentinel_path(run.path()))?;

        assert!(run.mark_in_progress().is_err());
        assert_eq!(run.state(), RunState::Failed);
        assert!(!run.path().exists());
        assert!(crate::chain::resolve(&job.job_folder)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_requires_sentinel() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let job = job(temp_dir.path(), Path::new("true"));
        let mut run = SnapshotRun::create(&job, name("20240101_000000"), None)?;

        assert!(run.execute(&CancellationToken::new()).await.is_err());
        assert_eq!(run.state(), RunState::Created);
        Ok(())
    }

    #[test]
    fn test_transfer_command_links_previous_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let job = job(temp_dir.path(), Path::new("true"));
        let previous = job.job_folder.join("20231231_000000");
        fs::create_dir_all(&previous)?;
        let link = crate::chain::resolve(&job.job_folder)?;

        let run = SnapshotRun::create(&job, name("20240101_000000"), link)?;
        let command = run.transfer_command()?;
        assert_eq!(command.link_dest, Some(previous));
        assert_eq!(command.destination, job.job_folder.join("20240101_000000"));
        Ok(())
    }
}
