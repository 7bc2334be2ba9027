//! Cancellation token for the allocation engine loop.
//!
//! The engine polls the token between blocking hardware calls; the worker
//! binary flips it exactly once from an OS signal listener. Tests flip it
//! directly.

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// Sending half: flips the token. Cloneable so mocks can hold one.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiving half: polled by the engine loop.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

/// Create a shutdown channel.
pub fn channel() -> (ShutdownHandle, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownToken { rx })
}

impl ShutdownHandle {
    /// Request shutdown. Idempotent; later calls are no-ops.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownToken {
    /// Whether shutdown has been requested. Non-blocking.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Listen for SIGTERM/SIGINT and trigger the handle on the first one.
pub async fn listen_for_signals(handle: ShutdownHandle) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, requesting stop"),
        _ = sigint.recv() => info!("Received SIGINT, requesting stop"),
    }

    handle.trigger();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_unset() {
        let (_handle, token) = channel();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let (handle, token) = channel();
        handle.trigger();
        handle.trigger();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_on_trigger() {
        let (handle, mut token) = channel();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });
        handle.trigger();
        waiter.await.unwrap();
    }
}
