//! Graceful Shutdown Handling
//!
//! The first SIGTERM or SIGINT cancels the process-wide token; every task
//! watches it and winds down. A second signal exits immediately.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;

/// Exit status used when a second signal forces termination
pub const FORCED_EXIT_CODE: i32 = 1;

/// Owns the process-wide cancellation token
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to every long-running component
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Listen for the first signal, then for a forcing second one.
    ///
    /// Both waits share one set of signal streams, so a signal arriving
    /// between them is still delivered.
    pub async fn run_signal_handler(self) -> Result<()> {
        info!("Starting shutdown signal listener");
        let mut signals = ShutdownSignals::new()?;

        tokio::select! {
            received = signals.recv() => {
                info!("Received {}, initiating graceful shutdown", received?);
                self.cancel();
            }
            // Cancelled from elsewhere, e.g. a component failed.
            _ = self.token.cancelled() => {
                debug!("Shutdown started without a signal");
            }
        }

        let signal_name = signals.recv().await?;
        warn!("Received second {}, terminating immediately", signal_name);
        force_terminate();
    }
}

/// Exit now, skipping graceful teardown
pub fn force_terminate() -> ! {
    std::process::exit(FORCED_EXIT_CODE)
}

/// SIGTERM and SIGINT streams, registered once for the life of the process
pub struct ShutdownSignals {
    #[cfg(unix)]
    sigterm: signal::unix::Signal,
    #[cfg(unix)]
    sigint: signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    pub fn new() -> Result<Self> {
        use signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next signal and return its name
    #[cfg(unix)]
    pub async fn recv(&mut self) -> Result<&'static str> {
        let name = tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        };
        Ok(name)
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> Result<&'static str> {
        signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_coordinator_starts_running() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_cancelled());
        assert!(!coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_reaches_every_token() {
        let coordinator = ShutdownCoordinator::new();
        let first = coordinator.token();
        let second = coordinator.token();

        let waiter = tokio::spawn(async move { first.cancelled().await });
        coordinator.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_cancelled());
        assert!(coordinator.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_streams_deliver_repeated_signals() {
        let mut signals = ShutdownSignals::new().unwrap();
        let pid = std::process::id().to_string();

        for _ in 0..2 {
            let status = std::process::Command::new("kill")
                .args(["-s", "TERM", &pid])
                .status()
                .unwrap();
            assert!(status.success());

            let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(name, "SIGTERM");
        }
    }

    #[tokio::test]
    async fn test_child_scope_follows_parent() {
        let coordinator = ShutdownCoordinator::new();
        let child = coordinator.token().child_token();

        child.cancel();
        assert!(!coordinator.is_cancelled());

        let other_child = coordinator.token().child_token();
        coordinator.cancel();
        assert!(other_child.is_cancelled());
    }
}
