//! Bounded-concurrency gate for registry calls.
//!
//! A [`ThrottledWalker`] is shared by every branch of a graph walk. Each
//! remote call acquires a [`ThrottlePermit`] first; the permit returns its
//! slot when dropped, so failed and cancelled calls never leak a slot.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{BundleError, Result};

/// Shared in-flight bound plus the walk's cancellation signal.
#[derive(Debug, Clone)]
pub struct ThrottledWalker {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    cancel: CancellationToken,
}

/// A held slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

impl ThrottledWalker {
    /// Create a walker allowing at most `max_in_flight` concurrent calls.
    ///
    /// A bound of zero is raised to one.
    pub fn new(max_in_flight: usize) -> Self {
        Self::with_cancellation(max_in_flight, CancellationToken::new())
    }

    /// Create a walker bound to an externally owned cancellation token.
    pub fn with_cancellation(max_in_flight: usize, cancel: CancellationToken) -> Self {
        let capacity = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            cancel,
        }
    }

    /// Maximum number of concurrent calls.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// The cancellation token observed by [`take`](Self::take).
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every pending and future `take` on this walker.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for a free slot.
    ///
    /// Fails with [`BundleError::Cancelled`] if the walk is cancelled before
    /// or while waiting.
    pub async fn take(&self) -> Result<ThrottlePermit> {
        if self.cancel.is_cancelled() {
            return Err(BundleError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BundleError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                let permit = permit.map_err(|_| BundleError::Cancelled)?;
                Ok(ThrottlePermit { _permit: permit })
            }
        }
    }

    /// Run `call` while holding a slot.
    ///
    /// Cancellation during the call drops it and releases the slot.
    pub async fn run<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.take().await?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BundleError::Cancelled),
            result = call => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bound_is_respected() {
        let walker = ThrottledWalker::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let walker = walker.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                walker
                    .run(async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(walker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_slot_released_on_error() {
        let walker = ThrottledWalker::new(1);
        let result: Result<()> = walker
            .run(async { Err(BundleError::InternalInconsistency("boom".to_string())) })
            .await;
        assert!(result.is_err());
        assert_eq!(walker.in_flight(), 0);

        // The single slot is free again.
        let _permit = walker.take().await.unwrap();
        assert_eq!(walker.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_permit_drop_releases_slot() {
        let walker = ThrottledWalker::new(2);
        let permit = walker.take().await.unwrap();
        assert_eq!(walker.in_flight(), 1);
        drop(permit);
        assert_eq!(walker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_take_after_cancel_fails() {
        let walker = ThrottledWalker::new(2);
        walker.cancel();
        assert!(matches!(walker.take().await, Err(BundleError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let walker = ThrottledWalker::new(1);
        let held = walker.take().await.unwrap();

        let waiter = {
            let walker = walker.clone();
            tokio::spawn(async move { walker.take().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        walker.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(BundleError::Cancelled)));
        drop(held);
        assert_eq!(walker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_call() {
        let walker = ThrottledWalker::new(1);
        let task = {
            let walker = walker.clone();
            tokio::spawn(async move {
                walker
                    .run(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        walker.cancel();

        assert!(matches!(task.await.unwrap(), Err(BundleError::Cancelled)));
        assert_eq!(walker.in_flight(), 0);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let walker = ThrottledWalker::new(0);
        assert_eq!(walker.capacity(), 1);
    }
}
