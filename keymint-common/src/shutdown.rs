//! Shutdown signal channel.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// A multi-producer multi-consumer one-shot signal used to coordinate
/// graceful shutdown across tasks.
///
/// - Clone to get another handle; any handle can trigger.
/// - Handles created *after* the signal still observe it (unlike
///   [`tokio::sync::broadcast`]).
/// - Triggering more than once is harmless.
///
/// Implementation detail: a [`Semaphore`] with zero permits; closing the
/// semaphore is the signal, and the [`AcquireError`] every waiter receives is
/// the delivery.
///
/// [`AcquireError`]: tokio::sync::AcquireError
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    inner: Arc<Semaphore>,
}

impl ShutdownSignal {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Trigger the shutdown; all current and future `recv` calls complete.
    pub fn trigger(&self) {
        self.inner.close()
    }

    /// Wait for the signal. Returns immediately if already triggered.
    pub async fn recv(&self) {
        self.inner
            .acquire()
            .await
            .map_err(|_| ())
            .expect_err("Zero-permit semaphore only resolves by closing")
    }

    /// Whether the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[test]
    fn repeated_trigger_is_harmless() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn recv_is_pending_until_triggered() {
        let shutdown = ShutdownSignal::new();
        let receiver = shutdown.clone();
        let mut recv = tokio_test::task::spawn(receiver.recv());
        tokio_test::assert_pending!(recv.poll());

        shutdown.trigger();
        assert!(recv.is_woken());
        tokio_test::assert_ready!(recv.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscribers_still_observe() {
        let shutdown = ShutdownSignal::new();
        let early = shutdown.clone();
        time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();
        time::timeout(Duration::from_millis(1), early.recv())
            .await
            .expect("Should resolve immediately");

        let late = shutdown.clone();
        assert!(late.is_triggered());
        time::timeout(Duration::from_millis(1), late.recv())
            .await
            .expect("Should resolve immediately");
    }
}
