//! Deduplicating, rate-limited work queue.
//!
//! A key is present at most once in the queue. A key that is added while a
//! worker holds it is marked dirty and queued again when the worker calls
//! [`WorkQueue::done`], so one key is never processed by two workers at the
//! same time and a change observed mid-reconcile is never lost.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Per-key exponential backoff for failed items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RateLimit {
    /// Delay for the given number of previous failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    waiting: HashMap<K, Instant>,
}

struct QueueInner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    shutting_down: AtomicBool,
    rate_limit: RateLimit,
}

/// Deduplicating work queue of keys.
pub struct WorkQueue<K> {
    inner: Arc<QueueInner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create an empty queue.
    pub fn new(rate_limit: RateLimit) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    waiting: HashMap::new(),
                }),
                notify: Notify::new(),
                shutting_down: AtomicBool::new(false),
                rate_limit,
            }),
        }
    }

    /// Queue a key. No-op if it is already queued or the queue is shut down.
    pub fn add(&self, key: K) {
        if self.is_shutting_down() {
            return;
        }
        let mut state = self.inner.state.lock();
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queue a key after a delay. A key already waiting keeps the earlier
    /// of the two deadlines.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.waiting.get(&key).is_some_and(|d| *d <= deadline) {
                return;
            }
            state.waiting.insert(key.clone(), deadline);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut state = queue.inner.state.lock();
                if state.waiting.get(&key) == Some(&deadline) {
                    state.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Queue a key after its per-key backoff delay, and grow that delay.
    pub fn add_rate_limited(&self, key: K) {
        let failures = {
            let mut state = self.inner.state.lock();
            let entry = state.failures.entry(key.clone()).or_insert(0);
            let previous = *entry;
            *entry = entry.saturating_add(1);
            previous
        };
        self.add_after(key, self.inner.rate_limit.delay_for(failures));
    }

    /// Reset the backoff of a key.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Number of rate-limited requeues since the last [`forget`](Self::forget).
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                if self.is_shutting_down() {
                    return None;
                }
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key obtained from [`get`](Self::get). If it was added again
    /// in the meantime it goes back into the queue.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !self.is_shutting_down() {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True when no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(RateLimit::default())
    }

    #[tokio::test]
    async fn deduplicates_queued_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn key_added_while_processing_is_requeued_on_done() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        q.add("a".to_string());
        assert_eq!(q.len(), 0, "held key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn done_without_re_add_drops_key() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn shut_down_wakes_waiters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("a".to_string());
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_delivery() {
        let q = queue();
        q.add_after("a".to_string(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_key_keeps_earliest_deadline() {
        let q = queue();
        q.add_after("a".to_string(), Duration::from_secs(10));
        q.add_after("a".to_string(), Duration::from_secs(2));
        q.add_after("a".to_string(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(q.len(), 1);
        let key = q.get().await.unwrap();
        q.done(&key);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(q.is_empty(), "superseded timers must not fire");
    }

    #[test]
    fn rate_limit_grows_and_caps() {
        let limit = RateLimit {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        assert_eq!(limit.delay_for(0), Duration::from_millis(10));
        assert_eq!(limit.delay_for(2), Duration::from_millis(40));
        assert_eq!(limit.delay_for(10), Duration::from_millis(100));
        assert_eq!(limit.delay_for(200), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn forget_resets_backoff() {
        let q = queue();
        q.add_rate_limited("a".to_string());
        q.add_rate_limited("a".to_string());
        assert_eq!(q.num_requeues(&"a".to_string()), 2);
        q.forget(&"a".to_string());
        assert_eq!(q.num_requeues(&"a".to_string()), 0);
    }
}
