use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

/// FIFO blocking queue coordinating concurrent requesters against a shared
/// set of resources.
///
/// When a waiter is pending, `enqueue` hands the item straight to the oldest
/// one and never touches the idle store, so an idle item is never observable
/// while a waiter could have consumed it. Waiters resolve strictly in the
/// order their `dequeue` calls arrived.
pub(crate) struct WaitQueue<T> {
    inner: Mutex<QueueState<T>>,
}

struct QueueState<T> {
    idle: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    closed: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("wait queue is closed")]
pub(crate) struct QueueClosed;

impl<T: Send> WaitQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Return an item to the queue, or hand it directly to the oldest live
    /// waiter. Gives the item back if the queue has been closed.
    pub(crate) fn enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.lock("enqueue");
        if state.closed {
            return Err(item);
        }

        let mut item = item;
        // A send error means that waiter's receiver was dropped (an abandoned
        // acquire); skip it and try the next in arrival order.
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return Ok(()),
                Err(returned) => item = returned,
            }
        }

        state.idle.push_back(item);
        Ok(())
    }

    /// Take an item, resolving immediately from the idle store or suspending
    /// until a matching future `enqueue`.
    pub(crate) async fn dequeue(&self) -> Result<T, QueueClosed> {
        let receiver = {
            let mut state = self.lock("dequeue");
            if state.closed {
                return Err(QueueClosed);
            }
            if let Some(item) = state.idle.pop_front() {
                return Ok(item);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        receiver.await.map_err(|_| QueueClosed)
    }

    /// Close the queue: pending waiters resolve to [`QueueClosed`] and the
    /// remaining idle items are drained for the caller to dispose.
    pub(crate) fn close(&self) -> Vec<T> {
        let mut state = self.lock("close");
        state.closed = true;
        state.waiters.clear();
        state.idle.drain(..).collect()
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.lock("idle_len").idle.len()
    }

    pub(crate) fn waiter_len(&self) -> usize {
        self.lock("waiter_len").waiters.len()
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, QueueState<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op,
                    lock_kind = "mutex.lock",
                    result = "poisoned_recovered",
                    hint = "queue state may be stale after panic in another thread",
                    "Recovered from poisoned wait queue lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dequeue_resolves_immediately_when_idle() {
        let queue = WaitQueue::new();
        queue.enqueue(7u32).expect("open queue");
        assert_eq!(queue.idle_len(), 1);

        let item = queue.dequeue().await.expect("item available");
        assert_eq!(item, 7);
        assert_eq!(queue.idle_len(), 0);
    }

    #[tokio::test]
    async fn waiters_resolve_in_arrival_order() {
        let queue = std::sync::Arc::new(WaitQueue::new());

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await.expect("first waiter") }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await.expect("second waiter") }
        });
        tokio::task::yield_now().await;
        assert_eq!(queue.waiter_len(), 2);

        queue.enqueue(1u32).expect("open queue");
        queue.enqueue(2u32).expect("open queue");

        assert_eq!(first.await.expect("first join"), 1);
        assert_eq!(second.await.expect("second join"), 2);
    }

    #[tokio::test]
    async fn enqueue_bypasses_idle_store_when_waiters_pend() {
        let queue = std::sync::Arc::new(WaitQueue::new());

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await.expect("waiter resolves") }
        });
        tokio::task::yield_now().await;

        queue.enqueue(42u32).expect("open queue");
        // The item went straight to the waiter; the idle store never saw it.
        assert_eq!(queue.idle_len(), 0);
        assert_eq!(waiter.await.expect("join"), 42);
    }

    #[tokio::test]
    async fn abandoned_waiters_are_skipped() {
        let queue = WaitQueue::new();

        // Register a waiter, then drop its future before it resolves, the way
        // a timed-out acquire does.
        {
            let pending = std::pin::pin!(queue.dequeue());
            let raced = futures::future::select(pending, std::future::ready(())).await;
            drop(raced);
        }
        assert_eq!(queue.waiter_len(), 1);

        queue.enqueue(5u32).expect("open queue");
        assert_eq!(queue.dequeue().await.expect("item"), 5);
    }

    #[tokio::test]
    async fn close_drains_idle_and_fails_waiters() {
        let queue = std::sync::Arc::new(WaitQueue::new());
        queue.enqueue(1u32).expect("open queue");

        let drained = queue.close();
        assert_eq!(drained, vec![1]);

        assert_eq!(queue.dequeue().await, Err(QueueClosed));
        assert_eq!(queue.enqueue(2u32), Err(2));
    }
}
