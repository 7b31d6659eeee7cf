//! Rate-limited work queue
//!
//! A deduplicating queue with per-key retry backoff. Keys are coalesced while
//! queued, and a key handed to a worker is not handed out again until the
//! worker calls [`RateLimitedQueue::done`]; a key re-added while in flight is
//! queued again afterwards. This gives per-key serialization across any
//! number of workers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Base delay of the per-key exponential backoff.
const BASE_DELAY: Duration = Duration::from_millis(5);
/// Ceiling of the per-key exponential backoff.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Deduplicating, rate-limited work queue.
pub struct RateLimitedQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> RateLimitedQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Self::with_delays(BASE_DELAY, MAX_DELAY)
    }

    pub fn with_delays(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        })
    }

    /// Enqueue a key. Keys already waiting are coalesced; keys currently
    /// being processed are queued again once their worker calls `done`.
    pub fn add(&self, key: K) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down || inner.dirty.contains(&key) {
                return;
            }
            inner.dirty.insert(key.clone());
            if inner.processing.contains(&key) {
                return;
            }
            inner.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue has been shut
    /// down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    if !inner.queue.is_empty() {
                        // Cascade the wakeup so idle workers pick up the rest.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key as processed. If it was re-added in the meantime, it goes
    /// back on the queue.
    pub fn done(&self, key: &K) {
        let requeue = {
            let mut inner = self.inner.lock().unwrap();
            inner.processing.remove(key);
            if inner.dirty.contains(key) {
                inner.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeue {
            self.notify.notify_one();
        }
    }

    /// Re-enqueue a key after its per-key backoff delay, counting the
    /// failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let exponent = (*failures).min(31);
            *failures += 1;
            let delay = self
                .base_delay
                .saturating_mul(2u32.saturating_pow(exponent));
            delay.min(self.max_delay)
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Number of rate-limited requeues recorded for a key.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Clear the failure history of a key.
    pub fn forget(&self, key: &K) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    /// Stop accepting new keys. Workers drain what is queued, then `get`
    /// returns `None`.
    pub fn shut_down(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
