//! Transfer subprocess invocation.
//!
//! The transfer engine is an external program speaking the rsync argument
//! dialect. Arguments are built as a structured list and handed straight to
//! the process API; nothing goes through a shell.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::snapshot::SENTINEL;
use crate::utils::{Result, RunnerError};

/// Archive semantics every snapshot transfer uses.
///
/// `--archive` covers recursion, permissions, ownership, timestamps, symlinks
/// and devices. Ownership is kept as numeric ids, deletions on the source
/// are mirrored and sparse files stay sparse.
pub const BASE_FLAGS: &[&str] = &[
    "--archive",
    "--acls",
    "--xattrs",
    "--hard-links",
    "--numeric-ids",
    "--delete",
    "--sparse",
];

/// One fully resolved transfer invocation.
#[derive(Debug, Clone)]
pub struct TransferCommand {
    /// Transfer program, `rsync` unless configured otherwise.
    pub program: PathBuf,
    /// Source location, local path or `host:path`.
    pub source: String,
    /// New snapshot directory.
    pub destination: PathBuf,
    /// Previous complete snapshot to hardlink unchanged files against.
    pub link_dest: Option<PathBuf>,
    /// Exclusion patterns.
    pub excludes: Vec<String>,
    /// File with one exclusion pattern per line.
    pub exclude_from: Option<PathBuf>,
    /// Remote shell command, e.g. `ssh -p 2222`.
    pub remote_shell: Option<String>,
    /// Where the transfer writes its own log.
    pub log_file: PathBuf,
    /// Extra arguments placed before the source and destination.
    pub extra_args: Vec<String>,
}

impl TransferCommand {
    /// The argument list, without the program name.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = BASE_FLAGS.iter().map(OsString::from).collect();

        // Anchored so only the top-level sentinel is matched. Excluded files
        // are also protected from `--delete`.
        args.push(format!("--exclude=/{SENTINEL}").into());
        for pattern in &self.excludes {
            args.push(format!("--exclude={pattern}").into());
        }
        if let Some(file) = &self.exclude_from {
            args.push(prefixed("--exclude-from=", file.as_os_str()));
        }
        if let Some(link_dest) = &self.link_dest {
            args.push(prefixed("--link-dest=", link_dest.as_os_str()));
        }
        if let Some(shell) = &self.remote_shell {
            args.push(format!("--rsh={shell}").into());
        }
        args.push(prefixed("--log-file=", self.log_file.as_os_str()));
        args.extend(self.extra_args.iter().map(OsString::from));

        args.push(with_trailing_slash(OsStr::new(&self.source)));
        args.push(with_trailing_slash(self.destination.as_os_str()));
        args
    }

    /// Runs the transfer to completion, or kills it when `cancel` fires.
    ///
    /// Spawn failures are reported as transfer failures so the caller rolls
    /// the snapshot back the same way as for a non-zero exit.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ExitStatus> {
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RunnerError::io_at(parent, e))?;
        }

        let args = self.args();
        debug!(program = %self.program.display(), ?args, "Transfer invocation");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RunnerError::Transfer(format!("failed to start {}: {e}", self.program.display()))
            })?;

        info!(
            pid = child.id().unwrap_or_default(),
            destination = %self.destination.display(),
            link_dest = ?self.link_dest,
            "Transfer started"
        );

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|e| RunnerError::Transfer(format!("failed to wait for transfer: {e}")))?;
                info!(%status, "Transfer finished");
                Ok(status)
            }
            _ = cancel.cancelled() => {
                warn!("Shutdown requested, stopping transfer");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill transfer process");
                }
                Err(RunnerError::Interrupted)
            }
        }
    }
}

fn prefixed(flag: &str, value: &OsStr) -> OsString {
    let mut arg = OsString::from(flag);
    arg.push(value);
    arg
}

/// Appends `/` so the directory's contents are copied. A bare `host:`
/// already names the remote home directory and is left alone.
fn with_trailing_slash(path: &OsStr) -> OsString {
    let text = path.to_string_lossy();
    let mut arg = path.to_os_string();
    if !text.ends_with('/') && !text.ends_with(':') {
        arg.push("/");
    }
    arg
}

/// Absolute form of `path`, used for `--link-dest` which rsync resolves
/// relative to the destination otherwise.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| RunnerError::io_at(path, e))
}
