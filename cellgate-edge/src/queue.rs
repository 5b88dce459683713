//! Bounded in-memory queue between the normalizer (producers) and the uplink (consumer)
//!
//! Two overflow policies:
//! - `block`: producers wait for room (or cancellation); FIFO, nothing is lost
//! - `drop-oldest`: producers never wait; the oldest resident element is evicted

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::MachineEvent;

pub type EventQueue = BoundedQueue<MachineEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    Block,
    DropOldest,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue operation cancelled")]
    Cancelled,
}

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
    depth: AtomicUsize,
    evicted: AtomicU64,
}

impl<T: Send> BoundedQueue<T> {
    /// `capacity` is clamped to at least one slot
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            depth: AtomicUsize::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Admit `item`. Under `block` this waits for room and fails only when `cancel`
    /// fires first; under `drop-oldest` it always succeeds immediately.
    pub async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        match self.policy {
            OverflowPolicy::DropOldest => {
                self.push_evicting(item);
                Ok(())
            }
            OverflowPolicy::Block => self.push_blocking(item, cancel).await,
        }
    }

    fn push_evicting(&self, item: T) {
        {
            let mut items = self.items.lock();
            while items.len() >= self.capacity {
                items.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(item);
            self.depth.store(items.len(), Ordering::Relaxed);
        }
        self.not_empty.notify_one();
    }

    async fn push_blocking(&self, item: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        let mut pending = Some(item);
        loop {
            let room = self.not_full.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            {
                let mut items = self.items.lock();
                if items.len() < self.capacity {
                    if let Some(item) = pending.take() {
                        items.push_back(item);
                    }
                    self.depth.store(items.len(), Ordering::Relaxed);
                    drop(items);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = &mut room => {}
            }
        }
    }

    /// Take the oldest element without waiting
    pub fn try_dequeue(&self) -> Option<T> {
        let item = {
            let mut items = self.items.lock();
            let item = items.pop_front();
            self.depth.store(items.len(), Ordering::Relaxed);
            item
        };
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Wait for the next element; `None` once `cancel` fires
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            let ready = self.not_empty.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut ready => {}
            }
        }
    }

    /// Endless stream of buffered elements, ends only when `cancel` fires.
    /// Each call returns a fresh stream over the same buffer.
    pub fn drain_all(self: &Arc<Self>, cancel: CancellationToken) -> impl Stream<Item = T> + Send + 'static
    where
        T: 'static,
    {
        stream::unfold((Arc::clone(self), cancel), |(queue, cancel)| async move {
            let item = queue.dequeue(&cancel).await?;
            Some((item, (queue, cancel)))
        })
    }

    /// Best-effort count, may be stale by the time the caller reads it
    pub fn approximate_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Elements discarded by the drop-oldest policy since startup
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_under_block() {
        let queue = BoundedQueue::new(16, OverflowPolicy::Block);
        let cancel = CancellationToken::new();
        for i in 0..10 {
            queue.enqueue(i, &cancel).await.unwrap();
        }
        let mut out = Vec::new();
        for _ in 0..10 {
            out.push(queue.dequeue(&cancel).await.unwrap());
        }
        assert_eq!(out, (0..10).collect::<Vec<_>>());
        assert_eq!(queue.approximate_depth(), 0);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_last_capacity() {
        let queue = BoundedQueue::new(5, OverflowPolicy::DropOldest);
        let cancel = CancellationToken::new();
        for i in 0..8 {
            queue.enqueue(i, &cancel).await.unwrap();
        }
        assert_eq!(queue.approximate_depth(), 5);
        assert_eq!(queue.evicted_count(), 3);

        let mut out = Vec::new();
        while let Some(item) = queue.try_dequeue() {
            out.push(item);
        }
        assert_eq!(out, vec![3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_block_waits_for_room() {
        let queue = Arc::new(BoundedQueue::new(2, OverflowPolicy::Block));
        let cancel = CancellationToken::new();
        queue.enqueue(1, &cancel).await.unwrap();
        queue.enqueue(2, &cancel).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.enqueue(3, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.approximate_depth(), 2);

        assert_eq!(queue.try_dequeue(), Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.try_dequeue(), Some(2));
        assert_eq!(queue.try_dequeue(), Some(3));
    }

    #[tokio::test]
    async fn test_blocked_enqueue_cancelled() {
        let queue = BoundedQueue::new(1, OverflowPolicy::Block);
        let cancel = CancellationToken::new();
        queue.enqueue("a", &cancel).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        assert_eq!(queue.enqueue("b", &cancel).await, Err(QueueError::Cancelled));
        assert_eq!(queue.approximate_depth(), 1);
    }

    #[tokio::test]
    async fn test_drain_all_yields_until_cancelled() {
        let queue = Arc::new(BoundedQueue::new(8, OverflowPolicy::Block));
        let cancel = CancellationToken::new();
        let mut drain = Box::pin(queue.drain_all(cancel.clone()));

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for i in 0..3 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    queue.enqueue(i, &cancel).await.unwrap();
                }
            })
        };

        for expected in 0..3 {
            assert_eq!(drain.next().await, Some(expected));
        }
        producer.await.unwrap();

        cancel.cancel();
        assert_eq!(drain.next().await, None);
    }
}
