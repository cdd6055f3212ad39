//! Graceful-shutdown plumbing.
//!
//! A watch channel fans the drain signal out to every connection task:
//! HTTP/1 connections mark their next response `Connection: close`, HTTP/2
//! connections send GOAWAY and finish in-flight streams. Triggering the
//! signal twice is the same as once.

use tokio::sync::watch;

/// Triggers a graceful shutdown of the server that produced it.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub(crate) fn new(tx: watch::Sender<bool>) -> ShutdownHandle {
        ShutdownHandle { tx }
    }

    /// Signals the server to stop accepting and drain. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_is_idempotent() {
        let (tx, mut rx) = watch::channel(false);
        let handle = ShutdownHandle::new(tx);
        handle.shutdown();
        handle.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        // no second change pending
        assert!(!rx.has_changed().unwrap());
    }
}
