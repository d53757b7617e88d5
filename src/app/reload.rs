//! Coalescing reload notification.
//!
//! A single-slot channel: producers never block, and while one
//! notification is pending any further posts are dropped.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Producer side, handed to routers and providers.
#[derive(Clone, Debug)]
pub struct ReloadNotifier {
    tx: mpsc::Sender<()>,
}

/// Consumer side, owned by the box and lent out read-only.
#[derive(Debug)]
pub struct ReloadSignal {
    rx: Arc<Mutex<mpsc::Receiver<()>>>,
}

pub fn reload_channel() -> (ReloadNotifier, ReloadSignal) {
    let (tx, rx) = mpsc::channel(1);
    (
        ReloadNotifier { tx },
        ReloadSignal {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl ReloadNotifier {
    /// Post a reload request. Returns `false` when one is already pending
    /// (or nobody listens any more); the post is then dropped.
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

impl ReloadSignal {
    /// Wait for the next reload request. Returns `false` once every
    /// producer is gone.
    pub async fn recv(&self) -> bool {
        self.rx.lock().await.recv().await.is_some()
    }

    /// Consume a pending request without waiting.
    pub fn try_recv(&self) -> bool {
        match self.rx.try_lock() {
            Ok(mut rx) => rx.try_recv().is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn posts_coalesce_into_one() {
        let (notifier, signal) = reload_channel();
        assert!(notifier.notify());
        assert!(!notifier.notify());
        assert!(!notifier.clone().notify());

        assert!(signal.try_recv());
        assert!(!signal.try_recv());
    }

    #[tokio::test]
    async fn recv_wakes_on_post() {
        let (notifier, signal) = reload_channel();
        let waiter = tokio::spawn(async move { signal.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(notifier.notify());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn recv_ends_when_producers_drop() {
        let (notifier, signal) = reload_channel();
        drop(notifier);
        assert!(!signal.recv().await);
    }
}
