//! A work queue with per-key in-flight exclusion and rate-limited requeue.
//!
//! The guarantees the controllers build on:
//!
//! - adding a key that is already queued is a no-op (coalescing);
//! - adding a key that is currently being processed marks it *dirty* and the
//!   queue redelivers it once the current pass calls [`WorkQueue::done`] — a
//!   key is never processed by two workers at once, while distinct keys run
//!   with unlimited concurrency (bounded only by the worker count);
//! - [`WorkQueue::add_rate_limited`] requeues with per-key exponential
//!   backoff; [`WorkQueue::forget`] resets the key's failure history;
//! - after [`WorkQueue::shut_down`], [`WorkQueue::next`] returns `None` so
//!   workers stop dequeuing while in-flight passes finish normally.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tokio::sync::Notify;

struct QueueState<T> {
    queue: VecDeque<T>,
    queued: AHashSet<T>,
    active: AHashSet<T>,
    dirty: AHashSet<T>,
    retries: AHashMap<T, u32>,
    shutdown: bool,
}

/// Shared handle to a work queue of keys `T`.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// A queue with the given requeue backoff bounds.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(WorkQueue {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: AHashSet::new(),
                active: AHashSet::new(),
                dirty: AHashSet::new(),
                retries: AHashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        })
    }

    /// Enqueue a key for processing.
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if state.active.contains(&item) {
            // Redelivered after the in-flight pass completes.
            state.dirty.insert(item);
            return;
        }
        if state.queued.insert(item.clone()) {
            state.queue.push_back(item);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after a delay.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Enqueue a key with exponential backoff derived from its failure
    /// count.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.state.lock();
            let attempts = state.retries.entry(item.clone()).or_insert(0);
            let delay = backoff_delay(self.base_delay, self.max_delay, *attempts);
            *attempts = attempts.saturating_add(1);
            delay
        };
        self.add_after(item, delay);
    }

    /// Clear a key's failure history after a successful pass.
    pub fn forget(&self, item: &T) {
        self.state.lock().retries.remove(item);
    }

    /// How many times the key was requeued with backoff since it last
    /// succeeded.
    pub fn retries(&self, item: &T) -> u32 {
        self.state.lock().retries.get(item).copied().unwrap_or(0)
    }

    /// Wait for the next key. Marks it in-flight; the caller must invoke
    /// [`WorkQueue::done`] when finished. Returns `None` once the queue has
    /// been shut down.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.queued.remove(&item);
                    state.active.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark an in-flight key finished; if it was re-added while in flight it
    /// is redelivered.
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.active.remove(item);
        if state.dirty.remove(item) && !state.shutdown && state.queued.insert(item.clone()) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop delivering keys. In-flight work is unaffected.
    pub fn shut_down(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting (not counting in-flight ones).
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<&'static str>> {
        WorkQueue::new(Duration::from_millis(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn coalesces_queued_duplicates() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, Some("b"));
    }

    #[tokio::test]
    async fn in_flight_key_is_redelivered_not_double_dispatched() {
        let q = queue();
        q.add("a");
        let item = q.next().await.unwrap();
        // re-added while in flight: must not become dequeueable yet
        q.add("a");
        assert!(q.is_empty());
        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await, Some("a"));
    }

    #[tokio::test]
    async fn rate_limited_requeue_counts_and_forget_resets() {
        let q = queue();
        q.add_rate_limited("a");
        q.add("sentinel"); // added instantly, drains first if "a" is delayed
        assert_eq!(q.retries(&"a"), 1);
        let first = q.next().await.unwrap();
        let second = q.next().await.unwrap();
        assert_eq!(
            {
                let mut got = [first, second];
                got.sort_unstable();
                got
            },
            ["a", "sentinel"]
        );
        q.forget(&"a");
        assert_eq!(q.retries(&"a"), 0);
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(5));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, max, 30), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[tokio::test]
    async fn shutdown_stops_dequeues() {
        let q = queue();
        q.add("a");
        q.shut_down();
        assert_eq!(q.next().await, None);
        // adds after shutdown are dropped
        q.add("b");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn waiting_workers_wake_on_add() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;
        q.add("a");
        assert_eq!(waiter.await.unwrap(), Some("a"));
    }
}
