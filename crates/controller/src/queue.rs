//! Deduplicating work queue with per-key serialization and failure backoff.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::warn;

struct State<K> {
    queued: FxHashSet<K>,
    order: VecDeque<K>,
    /// Keys handed to a worker and not yet `done`.
    processing: FxHashSet<K>,
    /// Keys added while processing; re-queued on `done`.
    dirty: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    /// Set while the backlog is past the high-water mark.
    backlogged: bool,
    shutdown: bool,
}

/// FIFO of keys where a key is pending at most once and is never handed to
/// two workers at the same time. Unbounded: dedup keeps it to one entry per
/// key, and a backlog past `high_water` is only reported.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    high_water: usize,
    backoff: Duration,
    backoff_max: Duration,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    pub fn new(high_water: usize, backoff: Duration, backoff_max: Duration) -> Self {
        let state = State {
            queued: FxHashSet::default(),
            order: VecDeque::new(),
            processing: FxHashSet::default(),
            dirty: FxHashSet::default(),
            failures: FxHashMap::default(),
            backlogged: false,
            shutdown: false,
        };
        Self { state: Mutex::new(state), notify: Notify::new(), high_water: high_water.max(1), backoff, backoff_max }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the pending backlog is past the high-water mark.
    pub fn backlogged(&self) -> bool {
        self.lock().backlogged
    }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutdown {
            return;
        }
        if st.processing.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        if st.queued.contains(&key) {
            return;
        }
        st.queued.insert(key.clone());
        st.order.push_back(key);
        if st.order.len() > self.high_water && !st.backlogged {
            st.backlogged = true;
            counter!("work_queue_backlog_total", 1u64);
            warn!(pending = st.order.len(), high_water = self.high_water, "work queue backlog past high-water mark");
        }
        drop(st);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key; `None` once shut down and drained.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    if st.order.len() <= self.high_water / 2 {
                        st.backlogged = false;
                    }
                    st.processing.insert(key.clone());
                    return Some(key);
                }
                if st.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; a key added meanwhile goes back on the queue.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.remove(key) && !st.shutdown && st.queued.insert(key.clone()) {
            st.order.push_back(key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Record a failure of `key` and return how long to wait before retrying.
    ///
    /// Starts at the base delay and doubles per consecutive failure, capped.
    pub fn backoff(&self, key: &K) -> Duration {
        let mut st = self.lock();
        let n = st.failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Stop accepting keys and wake every waiting worker.
    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.shutdown = true;
        st.order.clear();
        st.queued.clear();
        drop(st);
        self.notify.notify_waiters();
    }
}
