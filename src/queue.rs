//! Coalescing work queue with per-key retry backoff.
//!
//! Keys are processed in FIFO order. Each queued key carries a payload,
//! typically the most recently observed object state; enqueueing a key
//! that is already queued replaces the payload instead of queueing twice,
//! so a burst of events for the same object collapses into a single
//! pending step against the newest state. A key that is being processed is
//! no longer queued and may be re-added, since the state it was processed
//! against can have changed in the meantime.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// First retry delay after a failure.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Upper bound for the retry delay.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// A FIFO queue that coalesces work per key and tracks per-key failure
/// counts for exponential backoff.
pub struct WorkQueue<K, V> {
    inner: Mutex<Inner<K, V>>,
    notify: Notify,
}

struct Inner<K, V> {
    order: VecDeque<K>,
    queued: HashMap<K, V>,
    failures: HashMap<K, u32>,
}

impl<K: Clone + Eq + Hash, V> WorkQueue<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                queued: HashMap::new(),
                failures: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue work for a key. If the key is already queued, only its
    /// payload is replaced; returns false in that case.
    pub fn add(&self, key: K, value: V) -> bool {
        let added = {
            let mut inner = self.inner.lock();
            let newly_queued = !inner.queued.contains_key(&key);
            if newly_queued {
                inner.order.push_back(key.clone());
            }
            inner.queued.insert(key, value);
            newly_queued
        };
        if added {
            self.notify.notify_one();
        }
        added
    }

    /// Enqueue work for a key unless newer work for it is already queued.
    ///
    /// Used for retries: if a fresh event arrived while the failed step
    /// was in flight, the retry must not clobber its newer payload.
    pub fn add_if_absent(&self, key: K, value: V) -> bool {
        let added = {
            let mut inner = self.inner.lock();
            if inner.queued.contains_key(&key) {
                false
            } else {
                inner.order.push_back(key.clone());
                inner.queued.insert(key, value);
                true
            }
        };
        if added {
            self.notify.notify_one();
        }
        added
    }

    /// Re-enqueue work after a delay, from a background task.
    pub fn add_after(self: &Arc<Self>, key: K, value: V, delay: Duration)
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add_if_absent(key, value);
        });
    }

    /// Pop the next key and its payload without waiting.
    pub fn try_next(&self) -> Option<(K, V)> {
        let mut inner = self.inner.lock();
        let key = inner.order.pop_front()?;
        let value = inner.queued.remove(&key)?;
        Some((key, value))
    }

    /// Wait for the next key and its payload.
    pub async fn next(&self) -> (K, V) {
        loop {
            if let Some(item) = self.try_next() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Record a successful step, resetting the key's failure count.
    pub fn done(&self, key: &K) {
        self.inner.lock().failures.remove(key);
    }

    /// Record a failed step and return the delay before the next retry.
    pub fn failed(&self, key: &K) -> Duration {
        let mut inner = self.inner.lock();
        let attempts = inner.failures.entry(key.clone()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        backoff_for(*attempts)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }
}

impl<K: Clone + Eq + Hash, V> Default for WorkQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff for the nth consecutive failure, bounded by
/// [`BACKOFF_MAX`].
fn backoff_for(attempts: u32) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}
