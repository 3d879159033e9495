//! kbind queue: deduplicating work queue with delayed and rate-limited adds

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

mod ratelimit;

pub use ratelimit::{default_controller_rate_limiter, Bucket, ItemExponential, MaxOf, RateLimiter};

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    // Keys that need processing: queued, or re-added while processing.
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    waiting: FxHashMap<String, Instant>,
    shutting_down: bool,
}

struct Inner {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
}

/// Work queue of string keys.
///
/// A key is queued at most once, handed to at most one worker at a time,
/// and redelivered once after `done` if it was added while being processed.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self { Self::with_rate_limiter(name, default_controller_rate_limiter()) }

    pub fn with_rate_limiter(name: &'static str, limiter: impl RateLimiter + 'static) -> Self {
        Self {
            inner: Arc::new(Inner { name, state: Mutex::new(State::default()), notify: Notify::new(), limiter: Box::new(limiter) }),
        }
    }

    pub fn name(&self) -> &'static str { self.inner.name }

    fn state(&self) -> MutexGuard<'_, State> { self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) }

    fn depth(&self, st: &State) {
        metrics::gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name);
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut st = self.state();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        metrics::counter!("workqueue_adds_total", 1u64, "name" => self.inner.name);
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            trace!(queue = self.inner.name, key = %key, "marked dirty while processing");
            return;
        }
        st.queue.push_back(key);
        self.depth(&st);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Next key to process, or `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    self.depth(&st);
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; requeue it if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut st = self.state();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.to_string());
            self.depth(&st);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed. Pending delays per key keep the earliest deadline.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut st = self.state();
            if st.shutting_down {
                return;
            }
            if matches!(st.waiting.get(&key), Some(existing) if *existing <= deadline) {
                return;
            }
            st.waiting.insert(key.clone(), deadline);
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                WorkQueue { inner }.fire(&key, deadline);
            }
        });
    }

    fn fire(&self, key: &str, deadline: Instant) {
        {
            let mut st = self.state();
            if st.waiting.get(key) != Some(&deadline) {
                return;
            }
            st.waiting.remove(key);
        }
        self.add(key);
    }

    /// Requeue `key` after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.limiter.when(key);
        metrics::counter!("workqueue_retries_total", 1u64, "name" => self.inner.name);
        trace!(queue = self.inner.name, key = %key, delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &str) { self.inner.limiter.forget(key); }

    pub fn num_requeues(&self, key: &str) -> u32 { self.inner.limiter.num_requeues(key) }

    /// Stop accepting keys and wake every blocked `get`. Queued keys still drain.
    pub fn shut_down(&self) {
        {
            let mut st = self.state();
            st.shutting_down = true;
            st.waiting.clear();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.state().shutting_down }

    pub fn len(&self) -> usize { self.state().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
