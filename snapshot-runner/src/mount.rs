//! Optional storage mount around a run.
//!
//! Mounting itself is delegated to external commands configured per job
//! (for example `["mount", "/mnt/backup"]`). The runner only guarantees
//! that a successful mount is paired with an unmount on every exit path.

use std::process::{Command, Stdio};
use tracing::{info, warn};

use crate::config::MountConfig;
use crate::utils::{Result, RunnerError};

/// A mounted resource that must be released.
#[derive(Debug)]
pub struct MountHandle {
    unmount: Vec<String>,
    mounted: bool,
}

impl MountHandle {
    /// Runs the mount command when the job enables mounting.
    pub fn mount(config: &MountConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        if config.unmount.is_empty() {
            return Err(RunnerError::Mount("unmount command is not configured".into()));
        }

        run_hook(&config.mount, "mount")?;
        info!(command = ?config.mount, "Storage mounted");

        Ok(Some(Self {
            unmount: config.unmount.clone(),
            mounted: true,
        }))
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Runs the unmount command once. Later calls are no-ops.
    pub fn release(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        run_hook(&self.unmount, "unmount")?;
        info!(command = ?self.unmount, "Storage unmounted");
        Ok(())
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Failed to release mount");
        }
    }
}

fn run_hook(argv: &[String], what: &str) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RunnerError::Mount(format!("{what} command is not configured")))?;

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .map_err(|e| RunnerError::Mount(format!("failed to run {what} command {program}: {e}")))?;

    if !status.success() {
        return Err(RunnerError::Mount(format!("{what} command exited with {status}")));
    }
    Ok(())
}
