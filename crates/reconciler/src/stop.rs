//! Cooperative cancellation for long-running waits.

use tokio::sync::watch;
use tracing::info;

/// Handle that requests every linked [`StopSignal`] to stop.
#[derive(Debug, Clone)]
pub struct Stopper {
    stop_tx: watch::Sender<bool>,
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopper {
    #[must_use]
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self { stop_tx }
    }

    /// Signal all waiters to stop.
    pub fn stop(&self) {
        info!("Stop requested");
        self.stop_tx.send_replace(true);
    }

    /// A receiving side linked to this stopper.
    #[must_use]
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            stop_rx: self.stop_tx.subscribe(),
        }
    }
}

/// Receiving side of a [`Stopper`].
#[derive(Debug, Clone)]
pub struct StopSignal {
    stop_rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_stop_tx, stop_rx) = watch::channel(false);
        Self { stop_rx }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolve once a stop is requested. Never resolves if the stopper is gone.
    pub async fn stopped(&self) {
        let mut stop_rx = self.stop_rx.clone();
        loop {
            if *stop_rx.borrow_and_update() {
                return;
            }
            if stop_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_reaches_existing_signals() {
        let stopper = Stopper::new();
        let signal = stopper.signal();
        assert!(!signal.is_stopped());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.stopped().await }
        });
        stopper.stop();

        let joined = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(joined, Ok(Ok(()))));
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let signal = StopSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.stopped()).await;
        assert!(result.is_err());
        assert!(!signal.is_stopped());
    }
}
