//! Requeue delay policies.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long a key waits before it is retried.
pub trait RateLimiter: Send + Sync {
    /// Delay for the next retry of `key`; counts as a failure.
    fn when(&self, key: &str) -> Duration;
    /// Stop tracking `key` (it succeeded).
    fn forget(&self, key: &str);
    fn num_requeues(&self, key: &str) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponential {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<String, u32>>,
}

impl ItemExponential {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl RateLimiter for ItemExponential {
    fn when(&self, key: &str) -> Duration {
        let mut failures = lock(&self.failures);
        let n = failures.entry(key.to_string()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        2u32.checked_pow(exp)
            .and_then(|f| self.base.checked_mul(f))
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, key: &str) { lock(&self.failures).remove(key); }

    fn num_requeues(&self, key: &str) -> u32 { lock(&self.failures).get(key).copied().unwrap_or(0) }
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket: `qps` sustained with bursts up to `burst`.
pub struct Bucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl Bucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, state: Mutex::new(BucketState { tokens: burst, last: Instant::now() }) }
    }
}

impl RateLimiter for Bucket {
    fn when(&self, _key: &str) -> Duration {
        let mut st = lock(&self.state);
        let now = Instant::now();
        let refill = now.saturating_duration_since(st.last).as_secs_f64() * self.qps;
        st.tokens = (st.tokens + refill).min(self.burst);
        st.last = now;
        // Reserve a token; a negative balance is the wait until it exists.
        st.tokens -= 1.0;
        if st.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-st.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 { 0 }
}

/// The longest delay of several limiters.
pub struct MaxOf(pub Vec<Box<dyn RateLimiter>>);

impl RateLimiter for MaxOf {
    fn when(&self, key: &str) -> Duration {
        self.0.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for l in &self.0 {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 { self.0.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0) }
}

/// Per-key exponential backoff combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter() -> MaxOf {
    let base_ms = std::env::var("KBIND_QUEUE_BASE_DELAY_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(5);
    let max_secs = std::env::var("KBIND_QUEUE_MAX_DELAY_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(1000);
    MaxOf(vec![
        Box::new(ItemExponential::new(Duration::from_millis(base_ms), Duration::from_secs(max_secs))),
        Box::new(Bucket::new(10.0, 100)),
    ])
}
