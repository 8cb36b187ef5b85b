//! Per-job execution lock.
//!
//! Two layers:
//! - a kernel `flock(LOCK_EX | LOCK_NB)` on `<lock_dir>/<job_id>.lock`, which
//!   is the only thing that decides mutual exclusion;
//! - a JSON holder record written into the same file, used for diagnostics
//!   and stale-lock reporting.
//!
//! Acquisition never waits. A run that finds the lock taken fails at once.

use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::utils::{Result, RunnerError};

const LOCK_MODE: u32 = 0o600;

/// Opening attempts before giving up on a lock file that keeps being replaced.
const OPEN_ATTEMPTS: usize = 3;

/// Holder identity persisted in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub hostname: String,
    pub job_id: String,
    pub started_at: DateTime<Local>,
}

impl LockRecord {
    fn current(job_id: &str) -> Self {
        Self {
            pid: std::process::id(),
            hostname: local_hostname(),
            job_id: job_id.to_string(),
            started_at: Local::now(),
        }
    }

    /// Whether the recorded process still exists.
    ///
    /// Records written on another host cannot be checked and count as alive.
    pub fn is_alive(&self) -> bool {
        if self.hostname != local_hostname() {
            return true;
        }
        pid_alive(self.pid)
    }
}

/// What the advisory record says about a job's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// No lock record.
    Free,
    /// The recorded holder is alive.
    Held(LockRecord),
    /// The recorded holder is gone.
    Stale(LockRecord),
}

/// An acquired job lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct JobLock {
    job_id: String,
    path: PathBuf,
    record: LockRecord,
    file: Option<Flock<File>>,
}

impl JobLock {
    /// Takes the lock for `job_id`, failing immediately if another run holds it.
    pub fn acquire(lock_dir: &Path, job_id: &str) -> Result<Self> {
        fs::create_dir_all(lock_dir).map_err(|e| RunnerError::io_at(lock_dir, e))?;
        let path = lock_path(lock_dir, job_id);

        for _ in 0..OPEN_ATTEMPTS {
            let file = open_lock_file(&path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => {
                    // A releasing run may have unlinked the file between our
                    // open and our flock; that inode no longer guards anything.
                    if !names_same_file(&path, &locked) {
                        debug!(path = %path.display(), "Lock file replaced during acquisition, reopening");
                        continue;
                    }
                    return Self::take_over(job_id, path, locked);
                }
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    return Err(contention(job_id, &path));
                }
                Err((_, errno)) => {
                    return Err(RunnerError::io_at(&path, std::io::Error::from(errno)));
                }
            }
        }

        Err(contention(job_id, &path))
    }

    fn take_over(job_id: &str, path: PathBuf, locked: Flock<File>) -> Result<Self> {
        let record = LockRecord::current(job_id);

        match read_record(&path) {
            Some(previous) if previous.pid != record.pid || previous.hostname != record.hostname => {
                if previous.is_alive() {
                    warn!(
                        job_id,
                        pid = previous.pid,
                        host = %previous.hostname,
                        "Lock record names a live process but the kernel lock was free, taking over"
                    );
                } else {
                    info!(
                        job_id,
                        pid = previous.pid,
                        since = %previous.started_at,
                        "Clearing stale lock left by a dead run"
                    );
                }
            }
            _ => {}
        }

        let content = serde_json::to_vec_pretty(&record)?;
        let io = |e| RunnerError::io_at(&path, e);
        let mut handle: &File = &locked;
        handle.set_len(0).map_err(io)?;
        handle.seek(SeekFrom::Start(0)).map_err(io)?;
        handle.write_all(&content).map_err(io)?;
        handle.sync_all().map_err(io)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(LOCK_MODE)).map_err(io)?;

        info!(job_id, pid = record.pid, path = %path.display(), "Acquired job lock");

        Ok(Self {
            job_id: job_id.to_string(),
            path,
            record,
            file: Some(locked),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Releases the lock. Calling it again is a no-op.
    ///
    /// The lock file is only deleted while it is still ours: same inode and
    /// same holder record. Otherwise it is left in place with a warning.
    pub fn release(&mut self) -> Result<()> {
        let Some(locked) = self.file.take() else {
            return Ok(());
        };

        let ours = names_same_file(&self.path, &locked)
            && read_record(&self.path).is_some_and(|r| r == self.record);

        let mut result = Ok(());
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    result = Err(RunnerError::io_at(&self.path, e));
                }
            }
        } else {
            warn!(
                job_id = %self.job_id,
                path = %self.path.display(),
                "Lock record is no longer owned by this run, leaving it in place"
            );
        }

        if let Err((_, errno)) = locked.unlock() {
            warn!(job_id = %self.job_id, error = %errno, "Failed to unlock job lock");
        }

        info!(job_id = %self.job_id, "Released job lock");
        result
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(job_id = %self.job_id, error = %e, "Failed to release job lock");
        }
    }
}

/// Lock file path for a job.
pub fn lock_path(lock_dir: &Path, job_id: &str) -> PathBuf {
    lock_dir.join(format!("{job_id}.lock"))
}

/// Reads the advisory record for a job without touching the kernel lock.
pub fn inspect(lock_dir: &Path, job_id: &str) -> LockStatus {
    match read_record(&lock_path(lock_dir, job_id)) {
        None => LockStatus::Free,
        Some(record) if record.is_alive() => LockStatus::Held(record),
        Some(record) => LockStatus::Stale(record),
    }
}

fn contention(job_id: &str, path: &Path) -> RunnerError {
    let holder = read_record(path);
    match &holder {
        Some(record) if !record.is_alive() => warn!(
            job_id,
            pid = record.pid,
            "Kernel lock is held but the recorded holder is gone"
        ),
        None => warn!(job_id, "Kernel lock is held but no holder record was found"),
        _ => {}
    }
    RunnerError::LockHeld {
        job_id: job_id.to_string(),
        holder,
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(LOCK_MODE)
        .open(path)
        .map_err(|e| RunnerError::io_at(path, e))
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

fn names_same_file(path: &Path, file: &File) -> bool {
    match (fs::metadata(path), file.metadata()) {
        (Ok(on_disk), Ok(open)) => on_disk.dev() == open.dev() && on_disk.ino() == open.ino(),
        _ => false,
    }
}

/// `kill(pid, 0)`: ESRCH means gone, EPERM means alive but not ours.
fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
