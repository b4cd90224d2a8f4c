//! Cancellation handle for an in-flight worker invocation.

use tokio::sync::watch;

/// Owner side: call [`CancelHandle::cancel`] to abort the paired invocation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Invocation side: resolves once the paired handle cancels.
///
/// If the [`CancelHandle`] is dropped without cancelling, the signal never
/// fires.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal with no handle; it never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_handle, signal) = cancellation();
        signal
    }

    /// Returns `true` if cancellation has already been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested.
    ///
    /// # Cancel Safety
    /// Cancel safe.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked handle/signal pair.
#[must_use]
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiting_signal() {
        let (handle, mut signal) = cancellation();
        assert!(!signal.is_cancelled());
        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });
        handle.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(joined, Ok(Ok(()))), "waiter must observe cancellation");
    }

    #[tokio::test]
    async fn cancel_before_wait_is_observed() {
        let (handle, mut signal) = cancellation();
        handle.cancel();
        handle.cancel();
        assert!(signal.is_cancelled());
        let res = tokio::time::timeout(Duration::from_millis(100), signal.cancelled()).await;
        assert!(res.is_ok(), "already-cancelled signal must resolve immediately");
    }

    #[tokio::test]
    async fn never_signal_does_not_fire() {
        let mut signal = CancelSignal::never();
        let res = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(res.is_err(), "never() must stay pending");
        assert!(!signal.is_cancelled());
    }
}
