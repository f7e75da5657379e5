use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::source::Disconnect;

/// Termination signals the guard listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Hangup,
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn number(&self) -> i32 {
        match self {
            ShutdownSignal::Hangup => 1,
            ShutdownSignal::Interrupt => 2,
            ShutdownSignal::Terminate => 15,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(ShutdownSignal),
    /// Shutdown was requested through [`LifecycleGuard::trigger`].
    Requested,
}

impl ShutdownReason {
    /// Process exit status: `128 + signo` for a signal, 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Signal(received) => 128 + received.number(),
            ShutdownReason::Requested => 0,
        }
    }
}

/// Shutdown hook for a running pipeline.
///
/// Waits for SIGHUP, SIGINT or SIGTERM (or a manual trigger) and then closes
/// the registered collaborator. Closing happens at most once no matter how many
/// callers ask for it; concurrent callers all wait for that single close.
#[derive(Clone)]
pub struct LifecycleGuard {
    closer: Arc<dyn Disconnect>,
    shutdown: CancellationToken,
    closed: Arc<OnceCell<()>>,
}

impl LifecycleGuard {
    pub fn new(closer: Arc<dyn Disconnect>) -> Self {
        Self {
            closer,
            shutdown: CancellationToken::new(),
            closed: Arc::new(OnceCell::new()),
        }
    }

    /// Request shutdown without a signal.
    pub fn trigger(&self) {
        self.shutdown.cancel();
    }

    /// Cancelled once shutdown has been requested by any means.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.initialized()
    }

    /// Wait for a termination signal or a manual trigger, then close.
    pub async fn wait_for_shutdown(&self) -> Result<ShutdownReason> {
        let mut sighup =
            signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        let reason = tokio::select! {
            _ = sighup.recv() => ShutdownReason::Signal(ShutdownSignal::Hangup),
            _ = sigint.recv() => ShutdownReason::Signal(ShutdownSignal::Interrupt),
            _ = sigterm.recv() => ShutdownReason::Signal(ShutdownSignal::Terminate),
            _ = self.shutdown.cancelled() => ShutdownReason::Requested,
        };

        match reason {
            ShutdownReason::Signal(received) => info!("received {}", received.name()),
            ShutdownReason::Requested => info!("shutdown requested"),
        }
        self.shutdown.cancel();

        self.close().await?;
        Ok(reason)
    }

    /// Disconnect the collaborator. Only the first call reaches it; a failed
    /// close is reported to every waiting caller and may be retried.
    pub async fn close(&self) -> Result<()> {
        self.closed
            .get_or_try_init(|| async {
                info!("disconnecting");
                self.closer.close().await.map_err(|e| {
                    error!(error = %e, "disconnect failed");
                    e
                })?;
                info!("disconnected");
                Ok::<_, anyhow::Error>(())
            })
            .await
            .context("failed to disconnect")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::RecordingCloser;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownReason::Signal(ShutdownSignal::Hangup).exit_code(), 129);
        assert_eq!(ShutdownReason::Signal(ShutdownSignal::Interrupt).exit_code(), 130);
        assert_eq!(ShutdownReason::Signal(ShutdownSignal::Terminate).exit_code(), 143);
        assert_eq!(ShutdownReason::Requested.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_trigger_closes_once() {
        let closer = Arc::new(RecordingCloser::new());
        let guard = LifecycleGuard::new(closer.clone());

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.wait_for_shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(closer.closes(), 0);

        guard.trigger();
        let reason = waiter.await.unwrap().unwrap();

        assert_eq!(reason, ShutdownReason::Requested);
        assert_eq!(closer.closes(), 1);
        assert!(guard.is_closed());
        assert!(guard.shutdown_token().is_cancelled());

        guard.close().await.unwrap();
        assert_eq!(closer.closes(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_closes_share_one_disconnect() {
        let closer = Arc::new(RecordingCloser::new());
        let guard = LifecycleGuard::new(closer.clone());

        let (a, b, c) = tokio::join!(guard.close(), guard.close(), guard.close());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(closer.closes(), 1);
    }

    #[tokio::test]
    async fn test_failed_close_is_reported() {
        let closer = Arc::new(RecordingCloser::failing());
        let guard = LifecycleGuard::new(closer.clone());

        let err = guard.close().await.unwrap_err();
        assert!(format!("{err:#}").contains("disconnect failed"));
        assert!(!guard.is_closed());
    }
}
