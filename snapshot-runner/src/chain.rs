//! Incremental chain resolution.
//!
//! The newest complete snapshot in a job folder is the `--link-dest` source
//! for the next run. No candidate means a full backup.

use std::path::Path;
use tracing::{debug, info};

use crate::snapshot::{self, Snapshot, SnapshotName};
use crate::utils::Result;

/// Picks the newest complete snapshot in `job_folder`.
///
/// The scan is a point-in-time view and takes no lock on the snapshots it
/// reads.
pub fn resolve(job_folder: &Path) -> Result<Option<Snapshot>> {
    resolve_excluding(job_folder, None)
}

/// Like [`resolve`], but never returns the snapshot named `current`.
pub fn resolve_excluding(
    job_folder: &Path,
    current: Option<&SnapshotName>,
) -> Result<Option<Snapshot>> {
    let snapshots = snapshot::scan(job_folder)?;
    let total = snapshots.len();

    let latest = snapshots
        .into_iter()
        .filter(Snapshot::is_complete)
        .filter(|s| Some(&s.name) != current)
        .max_by(|a, b| a.name.cmp(&b.name));

    match &latest {
        Some(s) => info!(link_dest = %s.name, "Incremental backup against latest complete snapshot"),
        None => info!("No complete snapshot found, running a full backup"),
    }
    debug!(scanned = total, "Chain resolution finished");

    Ok(latest)
}
