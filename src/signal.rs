//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM cancel a [`ShutdownToken`]. The daemon checks the token
//! at the top of every tick, and [`ShutdownToken::sleep`] wakes early when it
//! is cancelled. A mutation batch in progress always runs to completion.

use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancellation shared between the signal task and the loop.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    inner: CancellationToken,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Sleep for `duration` or until cancelled.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.inner.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Listens for SIGINT/SIGTERM and cancels the token it was given.
pub struct ShutdownGuard {
    token: ShutdownToken,
}

impl ShutdownGuard {
    /// Spawn the signal listener. Must be called inside a tokio runtime.
    ///
    /// If handlers cannot be registered (restricted environments) the guard
    /// is still created and only an explicit `cancel` stops the daemon.
    pub fn install(token: ShutdownToken) -> Self {
        let task_token = token.clone();
        tokio::spawn(async move {
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGINT handler: {}", e);
                    None
                }
            };

            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    None
                }
            };

            match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => info!("Received SIGINT, shutting down after the current tick"),
                        _ = term.recv() => info!("Received SIGTERM, shutting down after the current tick"),
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    info!("Received SIGINT, shutting down after the current tick");
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    info!("Received SIGTERM, shutting down after the current tick");
                }
                (None, None) => {
                    warn!("No signal handlers registered - graceful shutdown disabled");
                    return;
                }
            }
            task_token.cancel();
        });

        Self { token }
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_shutdown_token() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_shutdown_token_clone() {
        let token1 = ShutdownToken::new();
        let token2 = token1.clone();

        token1.cancel();
        assert!(token2.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let token = ShutdownToken::new();
        assert!(token.sleep(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_sleep_returns_early_on_cancel() {
        let token = ShutdownToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(30)).await);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_after_cancel_is_immediate() {
        let token = ShutdownToken::new();
        token.cancel();
        assert!(!token.sleep(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_sleep_wakes_every_waiter() {
        let token = ShutdownToken::new();
        let first = tokio::spawn({
            let token = token.clone();
            async move { token.sleep(Duration::from_secs(30)).await }
        });
        let second = tokio::spawn({
            let token = token.clone();
            async move { token.sleep(Duration::from_secs(30)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(!first.await.unwrap());
        assert!(!second.await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_keeps_token() {
        let guard = ShutdownGuard::install(ShutdownToken::new());
        assert!(!guard.token().is_cancelled());
    }
}
