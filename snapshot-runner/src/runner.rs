//! End-to-end job runs.
//!
//! A run acquires the job lock, mounts storage, recovers from earlier
//! crashes, resolves the chain, transfers into a fresh snapshot and then
//! applies retention, all inside one [`RunGuard`].

use std::fs;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain;
use crate::config::Job;
use crate::lock::JobLock;
use crate::mount::MountHandle;
use crate::recovery::{self, RunGuard};
use crate::retention::{self, RetentionPolicy, RetentionReport};
use crate::snapshot::SnapshotName;
use crate::supervisor::SnapshotRun;
use crate::utils::{Result, RunnerError};

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub snapshot: SnapshotName,
    pub path: PathBuf,
    /// Snapshot used as the hard-link base, `None` for a full copy.
    pub link_source: Option<SnapshotName>,
    /// Snapshots removed by startup recovery.
    pub recovered: Vec<PathBuf>,
    pub retention: RetentionReport,
}

/// Runs one backup of `job`.
///
/// Cancelling `cancel` aborts the transfer; the partial snapshot is deleted
/// and [`RunnerError::Interrupted`] is returned.
pub async fn run(job: &Job, cancel: &CancellationToken) -> Result<RunOutcome> {
    let mut guard = RunGuard::new(&job.id);
    let result = run_guarded(job, cancel, &mut guard).await;
    guard.finish(exit_code(&result));
    result
}

async fn run_guarded(job: &Job, cancel: &CancellationToken, guard: &mut RunGuard) -> Result<RunOutcome> {
    info!(job_id = %job.id, source = %job.source, folder = %job.job_folder.display(), "Starting run");

    prepare(job, guard)?;
    check_cancelled(cancel)?;

    let recovered = recovery::recover_interrupted(&job.job_folder)?;

    let name = SnapshotName::now();
    let link_source = chain::resolve_excluding(&job.job_folder, Some(&name))?;
    check_cancelled(cancel)?;

    let mut snapshot = SnapshotRun::create(job, name, link_source)?;
    guard.track_snapshot(snapshot.path());
    snapshot.mark_in_progress()?;

    let transferred = snapshot.execute(cancel).await;

    // Retention follows both successful and failed transfers, never an abort.
    let retention = match &transferred {
        Err(RunnerError::Interrupted) => RetentionReport::default(),
        _ => retention::apply(&job.retention, &job.job_folder, &job.log_dir, Some(snapshot.name())),
    };

    transferred?;
    guard.snapshot_completed();

    Ok(RunOutcome {
        snapshot: snapshot.name().clone(),
        path: snapshot.path().to_path_buf(),
        link_source: snapshot.link_source().map(|s| s.name.clone()),
        recovered,
        retention,
    })
}

/// Runs the retention sweeps for `job` without transferring.
///
/// Auto-clean is implied; the retain count still comes from the job.
pub fn clean(job: &Job) -> Result<RetentionReport> {
    let mut guard = RunGuard::new(&job.id);
    let result = clean_guarded(job, &mut guard);
    guard.finish(exit_code(&result));
    result
}

fn clean_guarded(job: &Job, guard: &mut RunGuard) -> Result<RetentionReport> {
    prepare(job, guard)?;

    let policy = RetentionPolicy {
        auto_clean: true,
        ..job.retention
    };
    Ok(retention::apply(&policy, &job.job_folder, &job.log_dir, None))
}

/// Lock, mount and job folder, in that order.
fn prepare(job: &Job, guard: &mut RunGuard) -> Result<()> {
    guard.hold_lock(JobLock::acquire(&job.lock_dir, &job.id)?);

    if let Some(mount) = MountHandle::mount(&job.mount)? {
        guard.hold_mount(mount);
    }

    fs::create_dir_all(&job.job_folder).map_err(|e| RunnerError::io_at(&job.job_folder, e))?;
    if let Err(e) = fs::create_dir_all(&job.log_dir) {
        warn!(path = %job.log_dir.display(), error = %e, "Failed to create log directory");
    }
    Ok(())
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RunnerError::Interrupted);
    }
    Ok(())
}

fn exit_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.exit_code(),
    }
}
