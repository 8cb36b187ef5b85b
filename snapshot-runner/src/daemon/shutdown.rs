//! Signal handling for a run.
//!
//! SIGINT, SIGTERM and SIGHUP cancel the run's token. The transfer child is
//! killed, the in-progress snapshot is deleted and the lock is released by
//! the run guard on its way out.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when a termination signal arrives.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Installs the handlers and spawns a task that cancels the token on
    /// the first signal.
    pub fn listen(&self) -> std::io::Result<()> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let token = self.token.clone();

        tokio::spawn(async move {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = hangup.recv() => "SIGHUP",
                _ = token.cancelled() => return,
            };
            warn!(signal = name, "Received termination signal, aborting run");
            token.cancel();
        });

        Ok(())
    }

    /// Cancels the run without a signal.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_signal_cancels_token() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.listen().unwrap();
        let token = coordinator.token();

        kill(Pid::this(), Signal::SIGHUP).unwrap();

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token cancelled by SIGHUP");
    }
}
