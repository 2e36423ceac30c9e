//! Cooperative shutdown signal.
//!
//! A `watch<bool>` channel wrapped in small types: the handle flips the
//! flag once, every holder of a [`Shutdown`] observes it. A dropped
//! handle counts as shutdown too, so detached tasks never outlive main.

use tokio::sync::watch;

/// Flips the shutdown flag. Held by `main`.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cloneable receiver side, one per long-running task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolve once shutdown is requested (or the handle is gone).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Create a linked handle/receiver pair. Initial state is "running".
pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let (handle, shutdown) = channel();
        handle.trigger();
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_shutdown() {
        let (handle, shutdown) = channel();
        drop(handle);
        shutdown.wait().await;
    }
}
