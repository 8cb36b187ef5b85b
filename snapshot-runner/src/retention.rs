//! Retention sweeps: failed snapshots, old snapshots and old transfer logs.
//!
//! Every sweep is best-effort. Failures are logged as warnings and counted
//! in the returned report, never propagated: cleanup must not fail a run.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::snapshot::{self, SnapshotName, SnapshotState};

/// Extension of per-run transfer logs.
pub const LOG_EXTENSION: &str = "log";

/// Retention settings for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Master switch for all three sweeps.
    pub auto_clean: bool,
    /// Complete snapshots and logs to keep. `None` or `0` disables rotation.
    pub retain: Option<u32>,
}

impl RetentionPolicy {
    /// Retain count when rotation is enabled.
    pub fn rotation_limit(&self) -> Option<usize> {
        match self.retain {
            Some(n) if n > 0 => Some(n as usize),
            _ => None,
        }
    }
}

/// Outcome of a single sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub failed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.deleted.extend(other.deleted);
        self.failed += other.failed;
    }
}

/// Outcome of all sweeps of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub failed_snapshots: SweepReport,
    pub old_snapshots: SweepReport,
    pub old_logs: SweepReport,
}

impl RetentionReport {
    pub fn deleted_count(&self) -> usize {
        self.failed_snapshots.deleted.len() + self.old_snapshots.deleted.len() + self.old_logs.deleted.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_snapshots.failed + self.old_snapshots.failed + self.old_logs.failed
    }
}

/// Runs the sweeps `policy` enables.
///
/// `current` is the snapshot of the run doing the cleanup, if any; it is
/// never purged as failed.
pub fn apply(
    policy: &RetentionPolicy,
    job_folder: &Path,
    log_dir: &Path,
    current: Option<&SnapshotName>,
) -> RetentionReport {
    let mut report = RetentionReport::default();
    if !policy.auto_clean {
        info!("Auto-clean disabled, skipping retention");
        return report;
    }

    report.failed_snapshots = purge_failed(job_folder, current);

    if let Some(retain) = policy.rotation_limit() {
        report.old_snapshots = rotate_snapshots(job_folder, retain);
        report.old_logs = rotate_logs(log_dir, retain);
    } else {
        info!("No retain count set, skipping snapshot and log rotation");
    }

    info!(
        deleted = report.deleted_count(),
        failed = report.failed_count(),
        "Retention finished"
    );
    report
}

/// Deletes every snapshot that still carries the sentinel, and any
/// `.discard-*` directory left by an interrupted deletion.
pub fn purge_failed(job_folder: &Path, current: Option<&SnapshotName>) -> SweepReport {
    let snapshots = match snapshot::scan(job_folder) {
        Ok(s) => s,
        Err(e) => {
            warn!(folder = %job_folder.display(), error = %e, "Failed to scan for failed snapshots");
            return SweepReport { deleted: Vec::new(), failed: 1 };
        }
    };

    let mut report = SweepReport::default();
    for snap in snapshots {
        if snap.state != SnapshotState::InProgress || Some(&snap.name) == current {
            continue;
        }
        report.merge(remove_dir(&snap.path, "Deleted failed snapshot"));
    }

    match snapshot::leftover_discards(job_folder) {
        Ok(leftovers) => {
            for path in leftovers {
                match fs::remove_dir_all(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), "Deleted unfinished deletion");
                        report.deleted.push(path);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete unfinished deletion");
                        report.failed += 1;
                    }
                }
            }
        }
        Err(e) => {
            warn!(folder = %job_folder.display(), error = %e, "Failed to list unfinished deletions");
            report.failed += 1;
        }
    }
    report
}

/// Keeps the `retain` newest complete snapshots and deletes the rest.
pub fn rotate_snapshots(job_folder: &Path, retain: usize) -> SweepReport {
    let complete: Vec<PathBuf> = match snapshot::scan(job_folder) {
        Ok(s) => s.into_iter().filter(|s| s.is_complete()).map(|s| s.path).collect(),
        Err(e) => {
            warn!(folder = %job_folder.display(), error = %e, "Failed to scan snapshots for rotation");
            return SweepReport { deleted: Vec::new(), failed: 1 };
        }
    };

    let mut report = SweepReport::default();
    // `scan` sorts oldest first.
    for path in oldest_beyond(&complete, retain) {
        report.merge(remove_dir(path, "Deleted old snapshot"));
    }
    report
}

/// Keeps the `retain` newest `<timestamp>.log` files in `log_dir`.
pub fn rotate_logs(log_dir: &Path, retain: usize) -> SweepReport {
    let logs = match list_logs(log_dir) {
        Ok(logs) => logs,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SweepReport::default(),
        Err(e) => {
            warn!(folder = %log_dir.display(), error = %e, "Failed to list transfer logs");
            return SweepReport { deleted: Vec::new(), failed: 1 };
        }
    };

    let mut report = SweepReport::default();
    for path in oldest_beyond(&logs, retain) {
        match fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "Deleted old transfer log");
                report.deleted.push(path.clone());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete transfer log");
                report.failed += 1;
            }
        }
    }
    report
}

/// Timestamp-named log files in `log_dir`, oldest first.
pub fn list_logs(log_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut logs: Vec<(SnapshotName, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let path = e.path();
            if path.extension()? != LOG_EXTENSION {
                return None;
            }
            let name = SnapshotName::parse(path.file_stem()?.to_str()?)?;
            Some((name, path))
        })
        .collect();

    logs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(logs.into_iter().map(|(_, path)| path).collect())
}

/// The leading entries of an ascending list that exceed `retain`.
fn oldest_beyond<T>(sorted: &[T], retain: usize) -> &[T] {
    let excess = sorted.len().saturating_sub(retain);
    &sorted[..excess]
}

fn remove_dir(path: &Path, message: &str) -> SweepReport {
    match snapshot::discard(path) {
        Ok(()) => {
            info!(path = %path.display(), "{message}");
            SweepReport { deleted: vec![path.to_path_buf()], failed: 0 }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete snapshot directory");
            SweepReport { deleted: Vec::new(), failed: 1 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::write_sentinel;
    use tempfile::TempDir;

    const FIVE: [&str; 5] = [
        "20240101_000000",
        "20240102_000000",
        "20240103_000000",
        "20240104_000000",
        "20240105_000000",
    ];

    fn remaining(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn policy(auto_clean: bool, retain: Option<u32>) -> RetentionPolicy {
        RetentionPolicy { auto_clean, retain }
    }

    #[test]
    fn test_rotation_keeps_newest() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        for name in FIVE {
            fs::create_dir(temp_dir.path().join(name))?;
        }

        let report = rotate_snapshots(temp_dir.path(), 2);
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.failed, 0);
        assert_eq!(remaining(temp_dir.path()), ["20240104_000000", "20240105_000000"]);

        // Idempotent.
        assert!(rotate_snapshots(temp_dir.path(), 2).deleted.is_empty());
        Ok(())
    }

    #[test]
    fn test_no_retain_count_means_no_rotation() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let logs = temp_dir.path().join("logs");
        fs::create_dir(&logs)?;
        for name in FIVE {
            fs::create_dir(temp_dir.path().join(name))?;
            fs::write(logs.join(format!("{name}.log")), b"")?;
        }

        for retain in [None, Some(0)] {
            let report = apply(&policy(true, retain), temp_dir.path(), &logs, None);
            assert_eq!(report.deleted_count(), 0);
        }
        assert_eq!(remaining(temp_dir.path()).len(), 6);
        assert_eq!(remaining(&logs).len(), 5);
        Ok(())
    }

    #[test]
    fn test_auto_clean_off_skips_everything() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        for name in FIVE {
            fs::create_dir(temp_dir.path().join(name))?;
        }
        write_sentinel(&temp_dir.path().join(FIVE[0])).unwrap();

        let report = apply(&policy(false, Some(1)), temp_dir.path(), temp_dir.path(), None);
        assert_eq!(report, RetentionReport::default());
        assert_eq!(remaining(temp_dir.path()).len(), 5);
        Ok(())
    }

    #[test]
    fn test_failure_purge_ignores_retain_count() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        for name in FIVE {
            fs::create_dir(temp_dir.path().join(name))?;
        }
        write_sentinel(&temp_dir.path().join(FIVE[1])).unwrap();
        write_sentinel(&temp_dir.path().join(FIVE[3])).unwrap();

        let report = apply(&policy(true, None), temp_dir.path(), temp_dir.path(), None);
        assert_eq!(report.failed_snapshots.deleted.len(), 2);
        assert_eq!(
            remaining(temp_dir.path()),
            ["20240101_000000", "20240103_000000", "20240105_000000"]
        );
        Ok(())
    }

    #[test]
    fn test_failure_purge_removes_unfinished_deletions() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join(FIVE[0]))?;
        let leftover = temp_dir.path().join(format!(".discard-{}", FIVE[1]));
        fs::create_dir_all(leftover.join("nested"))?;

        let report = purge_failed(temp_dir.path(), None);
        assert_eq!(report.deleted, vec![leftover.clone()]);
        assert!(!leftover.exists());
        assert_eq!(remaining(temp_dir.path()), [FIVE[0]]);
        Ok(())
    }

    #[test]
    fn test_failure_purge_spares_current_run() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join(FIVE[0]))?;
        write_sentinel(&temp_dir.path().join(FIVE[0])).unwrap();

        let current = SnapshotName::parse(FIVE[0]);
        let report = purge_failed(temp_dir.path(), current.as_ref());
        assert!(report.deleted.is_empty());
        assert!(temp_dir.path().join(FIVE[0]).exists());
        Ok(())
    }

    #[test]
    fn test_rotation_skips_in_progress_and_malformed() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        for name in FIVE {
            fs::create_dir(temp_dir.path().join(name))?;
        }
        fs::create_dir(temp_dir.path().join("manual_copy"))?;
        write_sentinel(&temp_dir.path().join(FIVE[0])).unwrap();

        let report = rotate_snapshots(temp_dir.path(), 2);
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(
            remaining(temp_dir.path()),
            ["20240101_000000", "20240104_000000", "20240105_000000", "manual_copy"]
        );
        Ok(())
    }

    #[test]
    fn test_log_rotation() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        for name in FIVE {
            fs::write(temp_dir.path().join(format!("{name}.log")), b"")?;
        }
        fs::write(temp_dir.path().join("notes.log"), b"")?;
        fs::write(temp_dir.path().join("20240106_000000.txt"), b"")?;

        let report = rotate_logs(temp_dir.path(), 2);
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(
            remaining(temp_dir.path()),
            [
                "20240104_000000.log",
                "20240105_000000.log",
                "20240106_000000.txt",
                "notes.log"
            ]
        );
        Ok(())
    }

    #[test]
    fn test_missing_log_dir_is_not_a_failure() {
        let report = rotate_logs(Path::new("/nonexistent/snapshot-runner/logs"), 1);
        assert_eq!(report, SweepReport::default());
    }
}
