use std::time::Duration;

use tokio::sync::watch;

/// Operator side of cooperative cancellation.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Clear a previous cancellation so the next run starts fresh.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Worker side of cooperative cancellation. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires, for one-off runs outside a batch.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An error means every handle was dropped; nobody can cancel any more.
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` if cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_observed_by_all_signals() {
        let handle = CancelHandle::new();
        let a = handle.signal();
        let b = a.clone();
        assert!(!a.is_cancelled());
        handle.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_is_interrupted_by_cancel() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let completed = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn test_reset_clears_cancellation_for_existing_signals() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        handle.cancel();
        assert!(signal.is_cancelled());
        handle.reset();
        assert!(!signal.is_cancelled());
        assert!(signal.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_never_signal_sleeps_through() {
        let signal = CancelSignal::never();
        assert!(signal.sleep(Duration::from_millis(5)).await);
    }
}
