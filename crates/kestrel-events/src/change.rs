//! Single-slot "state changed" notification.
//!
//! The slot holds at most one pending wake-up. A notification that finds the
//! slot occupied is discarded, so observers must treat a wake-up as a hint to
//! re-read state rather than as a count of changes.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

/// Capacity-one, best-effort change notification shared by clone.
#[derive(Clone)]
pub struct ChangeSignal {
    sender: mpsc::Sender<()>,
    receiver: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl ChangeSignal {
    /// Create an empty signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Record that something changed. Never blocks; returns `false` when the
    /// slot was already full and the notification was coalesced.
    pub fn notify(&self) -> bool {
        self.sender.try_send(()).is_ok()
    }

    /// Wait until a notification is available and consume it.
    pub async fn changed(&self) {
        let mut receiver = self.receiver.lock().await;
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = receiver.recv().await;
    }

    /// Consume a pending notification without waiting.
    pub fn try_take(&self) -> bool {
        self.receiver
            .try_lock()
            .is_ok_and(|mut receiver| receiver.try_recv().is_ok())
    }
}

impl Default for ChangeSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn second_notification_is_coalesced() {
        let signal = ChangeSignal::new();
        assert!(signal.notify());
        assert!(!signal.notify(), "full slot should drop the notification");

        assert!(signal.try_take());
        assert!(!signal.try_take(), "only one wake-up should be stored");
    }

    #[tokio::test]
    async fn changed_wakes_on_notification_from_clone() {
        let signal = ChangeSignal::new();
        let notifier = signal.clone();

        let waiter = tokio::spawn(async move {
            signal.changed().await;
        });
        notifier.notify();

        timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task panicked");
    }
}
