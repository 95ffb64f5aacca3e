//! Bounded queue with configurable overflow behavior
//!
//! Prevents unbounded memory growth on write paths. Lossy flows (relay
//! traffic) drop oldest entries with a counter; reliable flows (handshake
//! steps) apply backpressure with a timeout instead of losing frames.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Behavior when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowBehavior {
    /// Drop the oldest entry to make room
    DropOldest,
    /// Drop the entry being enqueued
    DropNewest,
    /// Wait (bounded) for space
    Backpressure,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub overflow_behavior: OverflowBehavior,
    pub backpressure_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1024,
            overflow_behavior: OverflowBehavior::DropOldest,
            backpressure_timeout: Duration::from_millis(100),
        }
    }
}

/// Queue counters for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub high_water_mark: usize,
}

/// A bounded MPMC queue with async dequeue
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    config: QueueConfig,
    /// Wakes consumers on enqueue
    pop_ready: Notify,
    /// Wakes blocked producers on dequeue
    space_ready: Notify,
}

struct Inner<T> {
    items: VecDeque<T>,
    stats: QueueStats,
}

impl<T> BoundedQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(config.max_size.min(64)),
                stats: QueueStats::default(),
            }),
            config,
            pop_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    /// Enqueue following the configured overflow behavior. Returns `false`
    /// if the item was dropped (either end).
    pub async fn push(&self, item: T) -> bool {
        match self.config.overflow_behavior {
            OverflowBehavior::Backpressure => self.push_with_backpressure(item).await,
            _ => self.push_lossy(item),
        }
    }

    /// Synchronous enqueue for lossy configurations
    pub fn push_lossy(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.items.len() >= self.config.max_size {
            match self.config.overflow_behavior {
                OverflowBehavior::DropNewest => {
                    inner.stats.dropped += 1;
                    return false;
                }
                // Backpressure callers land here only via push_lossy;
                // shed oldest rather than block a sync context
                _ => {
                    inner.items.pop_front();
                    inner.stats.dropped += 1;
                }
            }
        }
        Self::push_inner(&mut inner, item);
        drop(inner);
        self.pop_ready.notify_one();
        true
    }

    async fn push_with_backpressure(&self, item: T) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.backpressure_timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.items.len() < self.config.max_size {
                    Self::push_inner(&mut inner, item);
                    drop(inner);
                    self.pop_ready.notify_one();
                    return true;
                }
            }
            let waited = tokio::time::timeout_at(deadline, self.space_ready.notified()).await;
            if waited.is_err() {
                self.inner.lock().stats.dropped += 1;
                return false;
            }
        }
    }

    fn push_inner(inner: &mut Inner<T>, item: T) {
        inner.items.push_back(item);
        inner.stats.enqueued += 1;
        let len = inner.items.len();
        if len > inner.stats.high_water_mark {
            inner.stats.high_water_mark = len;
        }
    }

    /// Non-blocking dequeue
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            inner.stats.dequeued += 1;
            drop(inner);
            self.space_ready.notify_one();
        }
        item
    }

    /// Await the next item
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.pop_ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats
    }

    /// Drop all queued items
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        drop(inner);
        self.space_ready.notify_one();
    }
}
