//! Read-only job status for the `status` command.

use serde::Serialize;
use std::fmt;

use crate::chain;
use crate::config::Job;
use crate::lock::{self, LockStatus};
use crate::retention;
use crate::snapshot::{self, SnapshotState};
use crate::utils::Result;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub complete: bool,
}

/// Snapshot of a job's on-disk state. Takes no locks.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub lock: LockSummary,
    pub snapshots: Vec<SnapshotEntry>,
    /// Base the next run would link against.
    pub next_link_dest: Option<String>,
    pub log_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum LockSummary {
    Free,
    Held { pid: u32, hostname: String, since: String },
    Stale { pid: u32, hostname: String, since: String },
}

impl From<LockStatus> for LockSummary {
    fn from(status: LockStatus) -> Self {
        match status {
            LockStatus::Free => LockSummary::Free,
            LockStatus::Held(r) => LockSummary::Held {
                pid: r.pid,
                hostname: r.hostname,
                since: r.started_at.to_rfc3339(),
            },
            LockStatus::Stale(r) => LockSummary::Stale {
                pid: r.pid,
                hostname: r.hostname,
                since: r.started_at.to_rfc3339(),
            },
        }
    }
}

pub fn collect(job: &Job) -> Result<JobStatus> {
    let snapshots = snapshot::scan(&job.job_folder)?
        .into_iter()
        .map(|s| SnapshotEntry {
            name: s.name.to_string(),
            complete: s.state == SnapshotState::Complete,
        })
        .collect();

    let next_link_dest = chain::resolve(&job.job_folder)?.map(|s| s.name.to_string());
    let log_count = retention::list_logs(&job.log_dir).map(|l| l.len()).unwrap_or(0);

    Ok(JobStatus {
        job_id: job.id.clone(),
        lock: lock::inspect(&job.lock_dir, &job.id).into(),
        snapshots,
        next_link_dest,
        log_count,
    })
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "job: {}", self.job_id)?;
        match &self.lock {
            LockSummary::Free => writeln!(f, "lock: free")?,
            LockSummary::Held { pid, hostname, since } => {
                writeln!(f, "lock: held by pid {pid} on {hostname} since {since}")?
            }
            LockSummary::Stale { pid, hostname, since } => {
                writeln!(f, "lock: stale (pid {pid} on {hostname} since {since})")?
            }
        }
        writeln!(f, "snapshots: {}", self.snapshots.len())?;
        for snap in &self.snapshots {
            let state = if snap.complete { "complete" } else { "in progress" };
            writeln!(f, "  {} {state}", snap.name)?;
        }
        writeln!(f, "next link-dest: {}", self.next_link_dest.as_deref().unwrap_or("none (full copy)"))?;
        write!(f, "logs: {}", self.log_count)
    }
}
