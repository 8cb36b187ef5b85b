//! Snapshot directories, their timestamp names and the in-progress sentinel.
//!
//! A snapshot is an immediate subdirectory of the job folder named
//! `YYYYMMDD_HHMMSS`. The fixed-width, zero-padded format makes lexicographic
//! order equal chronological order, so plain string comparison is used for
//! sorting everywhere. Names are taken in UTC so that wall-clock shifts
//! such as a DST fold never produce a name sorting before an earlier one.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::utils::{Result, RunnerError};

/// Marker file whose presence means the snapshot's transfer has not finished.
pub const SENTINEL: &str = "_job_is_processing_";

/// chrono format of a snapshot name.
pub const NAME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Prefix a snapshot is renamed to while it is being deleted.
pub const DISCARD_PREFIX: &str = ".discard-";

const NAME_LEN: usize = 15;

/// A validated snapshot timestamp name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotName(String);

impl SnapshotName {
    /// Name for a snapshot started at `at`.
    pub fn from_datetime<Tz: TimeZone>(at: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        SnapshotName(at.format(NAME_FORMAT).to_string())
    }

    /// Name for a snapshot started now, in UTC.
    pub fn now() -> Self {
        Self::from_datetime(&Utc::now())
    }

    /// Validates `name` as both a `\d{8}_\d{6}` shape and a real calendar timestamp.
    pub fn parse(name: &str) -> Option<Self> {
        if !has_timestamp_shape(name) {
            return None;
        }
        NaiveDateTime::parse_from_str(name, NAME_FORMAT)
            .ok()
            .map(|_| SnapshotName(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn has_timestamp_shape(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == NAME_LEN
        && bytes.iter().enumerate().all(|(i, b)| match i {
            8 => *b == b'_',
            _ => b.is_ascii_digit(),
        })
}

/// Whether a snapshot finished its transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// Sentinel present.
    InProgress,
    /// Sentinel absent.
    Complete,
}

/// A snapshot directory found in a job folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: SnapshotName,
    pub path: PathBuf,
    pub state: SnapshotState,
}

impl Snapshot {
    pub fn is_complete(&self) -> bool {
        self.state == SnapshotState::Complete
    }
}

/// Path of the sentinel inside a snapshot directory.
pub fn sentinel_path(snapshot_dir: &Path) -> PathBuf {
    snapshot_dir.join(SENTINEL)
}

/// Whether the sentinel exists. Only `NotFound` counts as absent; any
/// other error is returned.
pub fn sentinel_state(snapshot_dir: &Path) -> std::io::Result<bool> {
    match fs::symlink_metadata(sentinel_path(snapshot_dir)) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// True unless the sentinel is known to be absent.
pub fn has_sentinel(snapshot_dir: &Path) -> bool {
    !matches!(sentinel_state(snapshot_dir), Ok(false))
}

/// Writes the sentinel and flushes it to disk.
pub fn write_sentinel(snapshot_dir: &Path) -> Result<()> {
    let path = sentinel_path(snapshot_dir);
    let mut file = File::create(&path).map_err(|e| RunnerError::io_at(&path, e))?;
    writeln!(file, "pid={}", std::process::id()).map_err(|e| RunnerError::io_at(&path, e))?;
    file.sync_all().map_err(|e| RunnerError::io_at(&path, e))?;
    Ok(())
}

/// Removes the sentinel, turning an in-progress snapshot into a complete one.
pub fn remove_sentinel(snapshot_dir: &Path) -> Result<()> {
    let path = sentinel_path(snapshot_dir);
    fs::remove_file(&path).map_err(|source| RunnerError::SentinelRemoval { path, source })
}

/// Deletes a snapshot directory so it can never be mistaken for a complete one.
///
/// The directory is first renamed to a hidden, malformed name, which every
/// scan ignores, and only then removed recursively. An interrupted removal
/// therefore never leaves a partial snapshot under a valid name.
pub fn discard(snapshot_dir: &Path) -> std::io::Result<()> {
    let Some(name) = snapshot_dir.file_name() else {
        return fs::remove_dir_all(snapshot_dir);
    };
    let mut hidden = std::ffi::OsString::from(DISCARD_PREFIX);
    hidden.push(name);
    let doomed = snapshot_dir.with_file_name(hidden);

    match fs::rename(snapshot_dir, &doomed) {
        Ok(()) => fs::remove_dir_all(&doomed),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) => fs::remove_dir_all(snapshot_dir),
    }
}

/// Directories left behind by a [`discard`] whose removal did not finish.
pub fn leftover_discards(job_folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(job_folder) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    Ok(entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| e.file_name().to_string_lossy().starts_with(DISCARD_PREFIX))
        .map(|e| e.path())
        .collect())
}

/// Lists every well-named snapshot directory in `job_folder`, sorted oldest first.
///
/// Malformed names and non-directories are skipped, as are snapshots whose
/// sentinel cannot be read. A missing job folder yields an empty list.
pub fn scan(job_folder: &Path) -> Result<Vec<Snapshot>> {
    let entries = match fs::read_dir(job_folder) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RunnerError::io_at(job_folder, e)),
    };

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RunnerError::io_at(job_folder, e))?;
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if !file_type.is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(SnapshotName::parse) else {
            debug!(entry = ?file_name, "Ignoring malformed snapshot name");
            continue;
        };

        let path = entry.path();
        let state = match sentinel_state(&path) {
            Ok(true) => SnapshotState::InProgress,
            Ok(false) => SnapshotState::Complete,
            Err(e) => {
                warn!(snapshot = %name, error = %e, "Cannot read sentinel, ignoring snapshot");
                continue;
            }
        };
        snapshots.push(Snapshot { name, path, state });
    }

    snapshots.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(snapshots)
}
