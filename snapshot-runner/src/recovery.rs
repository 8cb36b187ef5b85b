//! Crash recovery.
//!
//! [`RunGuard`] owns everything a run must give back: the job lock, the
//! storage mount and the snapshot being written. Whatever way the run ends
//! (normal return, `?` error, panic unwind or a signal cancelling the
//! runtime) the same cleanup runs exactly once:
//!
//! 1. delete the current snapshot unless it completed
//! 2. release the lock
//! 3. unmount storage
//! 4. log the final status
//!
//! A SIGKILL or power loss skips all of this; [`recover_interrupted`] then
//! removes the leftover snapshot at the start of the next run.

use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::lock::JobLock;
use crate::mount::MountHandle;
use crate::snapshot::{self, SnapshotState};
use crate::utils::{Result, RunnerError};

/// Scoped owner of a run's resources.
pub struct RunGuard {
    job_id: String,
    lock: Option<JobLock>,
    mount: Option<MountHandle>,
    snapshot: Option<PathBuf>,
    snapshot_complete: bool,
    finished: bool,
}

impl RunGuard {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            lock: None,
            mount: None,
            snapshot: None,
            snapshot_complete: false,
            finished: false,
        }
    }

    pub fn hold_lock(&mut self, lock: JobLock) {
        self.lock = Some(lock);
    }

    pub fn hold_mount(&mut self, mount: MountHandle) {
        self.mount = Some(mount);
    }

    /// Registers the snapshot this run is writing.
    pub fn track_snapshot(&mut self, path: &Path) {
        self.snapshot = Some(path.to_path_buf());
        self.snapshot_complete = false;
    }

    /// Marks the tracked snapshot complete so cleanup keeps it.
    pub fn snapshot_completed(&mut self) {
        self.snapshot_complete = true;
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.as_ref().is_some_and(JobLock::is_held)
    }

    /// Runs the cleanup with the run's final exit code.
    pub fn finish(mut self, code: i32) -> i32 {
        self.cleanup(code);
        code
    }

    fn cleanup(&mut self, code: i32) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Some(path) = self.snapshot.take() {
            let exists = path.symlink_metadata().is_ok();
            if exists && (!self.snapshot_complete || snapshot::has_sentinel(&path)) {
                match snapshot::discard(&path) {
                    Ok(()) => info!(path = %path.display(), "Deleted incomplete snapshot"),
                    Err(e) => error!(
                        path = %path.display(),
                        error = %e,
                        "Failed to delete incomplete snapshot"
                    ),
                }
            }
        }

        if let Some(mut lock) = self.lock.take() {
            if let Err(e) = lock.release() {
                warn!(job_id = %self.job_id, error = %e, "Failed to release lock");
            }
        }

        if let Some(mut mount) = self.mount.take() {
            if let Err(e) = mount.release() {
                warn!(job_id = %self.job_id, error = %e, "Failed to unmount storage");
            }
        }

        if code == 0 {
            info!(job_id = %self.job_id, status = code, "Run finished");
        } else {
            error!(job_id = %self.job_id, status = code, "Run finished with errors");
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if std::thread::panicking() {
            error!(job_id = %self.job_id, "Run panicked, cleaning up");
        }
        self.cleanup(1);
    }
}

/// Deletes every snapshot in `job_folder` still marked in progress, plus
/// any `.discard-*` directory an earlier deletion left behind.
///
/// Only called while holding the job lock, so any such snapshot belongs to
/// a run that died. Deletion failures are logged; the chain resolver never
/// selects those snapshots anyway.
pub fn recover_interrupted(job_folder: &Path) -> Result<Vec<PathBuf>> {
    for leftover in snapshot::leftover_discards(job_folder).map_err(|e| RunnerError::io_at(job_folder, e))? {
        match std::fs::remove_dir_all(&leftover) {
            Ok(()) => info!(path = %leftover.display(), "Removed unfinished deletion"),
            Err(e) => warn!(path = %leftover.display(), error = %e, "Failed to remove unfinished deletion"),
        }
    }

    let mut removed = Vec::new();
    for snap in snapshot::scan(job_folder)? {
        if snap.state != SnapshotState::InProgress {
            continue;
        }
        match snapshot::discard(&snap.path) {
            Ok(()) => {
                warn!(snapshot = %snap.name, "Removed snapshot left by an interrupted run");
                removed.push(snap.path);
            }
            Err(e) => error!(
                snapshot = %snap.name,
                error = %e,
                "Failed to remove snapshot left by an interrupted run"
            ),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::lock::{self, LockStatus};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_finish_deletes_incomplete_and_releases_lock() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let locks = temp_dir.path().join("locks");
        let snap = temp_dir.path().join("20240101_000000");
        fs::create_dir(&snap)?;
        snapshot::write_sentinel(&snap)?;

        let mut guard = RunGuard::new("nightly");
        guard.hold_lock(JobLock::acquire(&locks, "nightly")?);
        guard.track_snapshot(&snap);
        assert!(guard.holds_lock());

        assert_eq!(guard.finish(1), 1);
        assert!(!snap.exists());
        assert_eq!(lock::inspect(&locks, "nightly"), LockStatus::Free);
        Ok(())
    }

    #[test]
    fn test_finish_keeps_complete_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let snap = temp_dir.path().join("20240101_000000");
        fs::create_dir(&snap)?;

        let mut guard = RunGuard::new("nightly");
        guard.track_snapshot(&snap);
        guard.snapshot_completed();
        guard.finish(0);
        assert!(snap.exists());
        Ok(())
    }

    #[test]
    fn test_finish_deletes_unfinished_snapshot_without_sentinel() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let older = temp_dir.path().join("20200101_000000");
        let snap = temp_dir.path().join("20300101_000000");
        fs::create_dir(&older)?;
        fs::create_dir(&snap)?;

        // The run created its directory but never got to write the sentinel.
        let mut guard = RunGuard::new("nightly");
        guard.track_snapshot(&snap);
        guard.finish(1);

        assert!(!snap.exists());
        let remaining = snapshot::scan(temp_dir.path())?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, older);
        Ok(())
    }

    #[test]
    fn test_drop_runs_cleanup() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let locks = temp_dir.path().join("locks");
        let snap = temp_dir.path().join("20240101_000000");
        let unmounted = temp_dir.path().join("unmounted");
        fs::create_dir(&snap)?;
        snapshot::write_sentinel(&snap)?;

        let mount = MountHandle::mount(&MountConfig {
            enabled: true,
            mount: vec!["true".into()],
            unmount: vec!["touch".into(), unmounted.display().to_string()],
        })?
        .expect("mount enabled");

        {
            let mut guard = RunGuard::new("nightly");
            guard.hold_lock(JobLock::acquire(&locks, "nightly")?);
            guard.hold_mount(mount);
            guard.track_snapshot(&snap);
        }

        assert!(!snap.exists());
        assert!(unmounted.exists());
        assert!(JobLock::acquire(&locks, "nightly").is_ok());
        Ok(())
    }

    #[test]
    fn test_cleanup_runs_on_panic() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let locks = temp_dir.path().join("locks");
        let snap = temp_dir.path().join("20240101_000000");
        fs::create_dir(&snap)?;
        snapshot::write_sentinel(&snap)?;

        let lock = JobLock::acquire(&locks, "nightly")?;
        let tracked = snap.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut guard = RunGuard::new("nightly");
            guard.hold_lock(lock);
            guard.track_snapshot(&tracked);
            panic!("transfer blew up");
        }));

        assert!(result.is_err());
        assert!(!snap.exists());
        assert_eq!(lock::inspect(&locks, "nightly"), LockStatus::Free);
        Ok(())
    }

    #[test]
    fn test_recover_interrupted() -> Result<()> {
        let temp_dir = TempDir::new()?;
        for name in ["20240101_000000", "20240102_000000", "20240103_000000"] {
            fs::create_dir(temp_dir.path().join(name))?;
        }
        let crashed = temp_dir.path().join("20240102_000000");
        fs::write(crashed.join("partial"), b"half a file")?;
        snapshot::write_sentinel(&crashed)?;

        let removed = recover_interrupted(temp_dir.path())?;
        assert_eq!(removed, vec![crashed.clone()]);
        assert!(!crashed.exists());
        assert_eq!(snapshot::scan(temp_dir.path())?.len(), 2);

        assert!(recover_interrupted(temp_dir.path())?.is_empty());

        let leftover = temp_dir.path().join(".discard-20231231_000000");
        fs::create_dir_all(leftover.join("deep"))?;
        recover_interrupted(temp_dir.path())?;
        assert!(!leftover.exists());
        Ok(())
    }
}
