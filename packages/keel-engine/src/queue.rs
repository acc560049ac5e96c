//! Bounded-concurrency operation queues.

use tokio::sync::{Semaphore, SemaphorePermit, oneshot};
use tracing::trace;

/// Bounds in-flight work by operation count and, optionally, by a
/// byte-weight "share". Both caps are enforced simultaneously: an
/// operation runs only once it holds one count permit and enough share
/// permits for its weight.
#[derive(Debug)]
pub struct OperationQueue {
    count: Semaphore,
    share: Option<Semaphore>,
    max_share: u32,
}

impl OperationQueue {
    /// A queue bounded by operation count only.
    pub fn new(max_operations: usize) -> Self {
        assert!(max_operations > 0, "queue must admit at least one operation");
        Self {
            count: Semaphore::new(max_operations),
            share: None,
            max_share: 0,
        }
    }

    /// Additionally bound the queue by total in-flight share.
    pub fn with_share_capacity(mut self, max_share: u32) -> Self {
        assert!(max_share > 0, "share capacity must be positive");
        self.share = Some(Semaphore::new(max_share as usize));
        self.max_share = max_share;
        self
    }

    /// Permits currently available by count.
    pub fn available(&self) -> usize {
        self.count.available_permits()
    }

    async fn acquire(&self, share: u32) -> (SemaphorePermit<'_>, Option<SemaphorePermit<'_>>) {
        // The semaphores are never closed, so acquisition cannot fail.
        let count = self
            .count
            .acquire()
            .await
            .expect("operation queue semaphore closed");
        let share = match &self.share {
            // An operation heavier than the whole capacity still has to
            // run; clamp it so it simply occupies the full queue.
            Some(semaphore) => Some(
                semaphore
                    .acquire_many(share.min(self.max_share))
                    .await
                    .expect("operation queue semaphore closed"),
            ),
            None => None,
        };
        (count, share)
    }

    /// Run `work` once the queue admits it.
    pub async fn enqueue<T>(&self, work: impl Future<Output = T>) -> T {
        self.enqueue_weighted(0, work).await
    }

    /// Run `work` with the given share weight once the queue admits it.
    pub async fn enqueue_weighted<T>(&self, share: u32, work: impl Future<Output = T>) -> T {
        let _permits = self.acquire(share).await;
        trace!(share, "operation admitted");
        work.await
    }

    /// As [`enqueue_weighted`], additionally returning a promise that fires
    /// when the work actually starts. Callers use it for backpressure:
    /// awaiting the promise blocks until the queue has admitted the work.
    ///
    /// [`enqueue_weighted`]: OperationQueue::enqueue_weighted
    pub fn enqueue_with_started<T>(
        &self,
        share: u32,
        work: impl Future<Output = T>,
    ) -> (oneshot::Receiver<()>, impl Future<Output = T>) {
        let (tx, rx) = oneshot::channel();
        let run = async move {
            let _permits = self.acquire(share).await;
            // The receiver may have been dropped; starting anyway is fine.
            let _ = tx.send(());
            work.await
        };
        (rx, run)
    }
}
