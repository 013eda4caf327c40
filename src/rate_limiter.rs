//! Bandwidth limiting using token bucket algorithm
//!
//! The RateLimiter provides a global bandwidth ceiling shared by all
//! concurrent downloads plus optional per-task ceilings, using an efficient
//! lock-free token bucket implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::TaskId;

/// Single token bucket
///
/// # Algorithm
///
/// - Tokens represent bytes that can be transferred
/// - Tokens refill at a constant rate (limit_bps)
/// - Downloads acquire tokens before transferring data
/// - If insufficient tokens, the acquiring worker waits until refill
///
/// # Implementation
///
/// Uses AtomicU64 for lock-free token tracking:
/// - `limit_bps`: limit in bytes per second (0 = unlimited)
/// - `tokens`: available tokens (bytes that can be transferred now)
/// - `last_refill`: timestamp of last token refill (nanoseconds since epoch)
#[derive(Clone)]
pub(crate) struct TokenBucket {
    /// Limit in bytes per second (0 = unlimited)
    limit_bps: Arc<AtomicU64>,
    /// Available tokens (current bucket capacity in bytes)
    tokens: Arc<AtomicU64>,
    /// Last refill timestamp (nanoseconds since arbitrary epoch)
    last_refill: Arc<AtomicU64>,
}

impl TokenBucket {
    pub(crate) fn new(limit_bps: Option<u64>) -> Self {
        let limit = limit_bps.unwrap_or(0);
        let now = now_nanos();

        Self {
            limit_bps: Arc::new(AtomicU64::new(limit)),
            tokens: Arc::new(AtomicU64::new(limit)),
            last_refill: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Set a new limit. Takes effect on the next acquisition loop iteration;
    /// if increasing, the bucket is topped up by the difference.
    pub(crate) fn set_limit(&self, limit_bps: Option<u64>) {
        let new_limit = limit_bps.unwrap_or(0);
        let old_limit = self.limit_bps.swap(new_limit, Ordering::SeqCst);

        if new_limit > old_limit {
            let extra_tokens = new_limit - old_limit;
            self.tokens.fetch_add(extra_tokens, Ordering::SeqCst);
        }
    }

    pub(crate) fn get_limit(&self) -> Option<u64> {
        let limit = self.limit_bps.load(Ordering::Relaxed);
        if limit == 0 { None } else { Some(limit) }
    }

    /// Acquire permission to transfer the specified number of bytes,
    /// suspending the calling worker until sufficient tokens accumulate.
    /// Unlimited buckets return immediately.
    pub(crate) async fn acquire(&self, bytes: u64) {
        // Fast path: nothing to acquire
        if bytes == 0 {
            return;
        }

        // Fast path: unlimited
        if self.limit_bps.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut remaining = bytes;

        loop {
            // Re-read the limit each iteration so runtime changes take effect
            let limit = self.limit_bps.load(Ordering::Relaxed);
            if limit == 0 {
                // Limit was removed while we were waiting
                return;
            }

            self.refill_tokens();

            // Try to consume available tokens (partial consumption allowed)
            let current_tokens = self.tokens.load(Ordering::SeqCst);
            let to_consume = remaining.min(current_tokens);

            if to_consume > 0 {
                if self
                    .tokens
                    .compare_exchange(
                        current_tokens,
                        current_tokens - to_consume,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    remaining -= to_consume;
                    if remaining == 0 {
                        return;
                    }
                }
                // CAS failed or still have remaining - retry immediately
                continue;
            }

            // No tokens available - wait for refill.
            // Cap sleep at 100ms so we re-check the limit frequently,
            // allowing runtime limit changes to take effect promptly.
            let wait_ms = (remaining as f64 / limit as f64 * 1000.0) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(10, 100))).await;
        }
    }

    /// Refill tokens based on elapsed time since last refill
    fn refill_tokens(&self) {
        let limit = self.limit_bps.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }

        let now = now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);

        let elapsed_nanos = now.saturating_sub(last);
        let elapsed_secs = elapsed_nanos as f64 / 1_000_000_000.0;

        let tokens_to_add = (limit as f64 * elapsed_secs) as u64;

        if tokens_to_add > 0 {
            if self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // Cap at limit (bucket capacity = one second of tokens)
                let current_tokens = self.tokens.load(Ordering::SeqCst);
                let new_tokens = (current_tokens + tokens_to_add).min(limit);
                self.tokens.store(new_tokens, Ordering::SeqCst);
            }
        }
    }
}

/// Get current monotonic time in nanoseconds
///
/// Uses a monotonic clock that is not affected by system time changes.
/// The epoch is arbitrary but consistent within a process lifetime.
fn now_nanos() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Global bandwidth limiter with optional per-task ceilings
///
/// All concurrent downloads share the global bucket, naturally distributing
/// bandwidth based on demand. A task with a per-task cap must pass both its
/// own bucket and the global one before transferring a chunk, so the
/// effective ceiling is the minimum of the two.
#[derive(Clone)]
pub struct RateLimiter {
    global: TokenBucket,
    per_task: Arc<std::sync::Mutex<HashMap<TaskId, TokenBucket>>>,
    /// Rolling count of bytes admitted through the limiter
    total_bytes: Arc<AtomicU64>,
}

impl RateLimiter {
    /// Create a new RateLimiter with the specified global limit
    /// (None = unlimited)
    #[must_use]
    pub fn new(global_limit_bps: Option<u64>) -> Self {
        Self {
            global: TokenBucket::new(global_limit_bps),
            per_task: Arc::new(std::sync::Mutex::new(HashMap::new())),
            total_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the global limit (None = unlimited)
    ///
    /// Takes effect on the next acquisition; workers already waiting re-read
    /// the limit each loop iteration.
    pub fn set_global_limit(&self, limit_bps: Option<u64>) {
        self.global.set_limit(limit_bps);
    }

    /// Get the current global limit (None = unlimited)
    pub fn global_limit(&self) -> Option<u64> {
        self.global.get_limit()
    }

    /// Set or clear a per-task limit (None = remove the cap)
    pub fn set_task_limit(&self, id: TaskId, limit_bps: Option<u64>) {
        let mut map = self.per_task.lock().unwrap_or_else(|e| e.into_inner());
        match limit_bps {
            Some(_) => match map.get(&id) {
                Some(bucket) => bucket.set_limit(limit_bps),
                None => {
                    map.insert(id, TokenBucket::new(limit_bps));
                }
            },
            None => {
                map.remove(&id);
            }
        }
    }

    /// Drop the per-task bucket for a task that reached a terminal state
    pub fn forget_task(&self, id: TaskId) {
        self.per_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Acquire permission to transfer `bytes` on behalf of `id`
    ///
    /// Suspends only the calling worker. The per-task bucket (if any) is
    /// drained first, then the global one.
    pub async fn acquire(&self, id: TaskId, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let task_bucket = self
            .per_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned();

        if let Some(bucket) = task_bucket {
            bucket.acquire(bytes).await;
        }
        self.global.acquire(bytes).await;

        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes admitted through the limiter since creation
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_limit_increase_tops_up_bucket() {
        let bucket = TokenBucket::new(Some(5_000_000));
        let old_tokens = bucket.tokens.load(Ordering::Relaxed);

        bucket.set_limit(Some(10_000_000));

        assert_eq!(bucket.get_limit(), Some(10_000_000));
        let new_tokens = bucket.tokens.load(Ordering::Relaxed);
        assert_eq!(new_tokens, old_tokens + 5_000_000);
    }

    #[test]
    fn set_limit_decrease_leaves_tokens_until_consumed() {
        let bucket = TokenBucket::new(Some(10_000_000));
        let old_tokens = bucket.tokens.load(Ordering::Relaxed);

        bucket.set_limit(Some(5_000_000));

        assert_eq!(bucket.get_limit(), Some(5_000_000));
        assert_eq!(bucket.tokens.load(Ordering::Relaxed), old_tokens);
    }

    #[test]
    fn unlimited_bucket_reports_none() {
        let bucket = TokenBucket::new(None);
        assert_eq!(bucket.get_limit(), None);
        assert_eq!(bucket.limit_bps.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn acquire_unlimited_returns_immediately() {
        let limiter = RateLimiter::new(None);

        let start = Instant::now();
        limiter.acquire(TaskId::new(1), 1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn acquire_counts_total_bytes() {
        let limiter = RateLimiter::new(None);

        limiter.acquire(TaskId::new(1), 100).await;
        limiter.acquire(TaskId::new(2), 250).await;

        assert_eq!(limiter.total_bytes(), 350);
    }

    #[tokio::test]
    async fn acquire_blocks_when_tokens_exhausted() {
        // Use a very low rate so we can measure the wait time
        let rate_bps = 1_000;
        let limiter = RateLimiter::new(Some(rate_bps));

        // Drain the bucket completely
        limiter.global.tokens.store(0, Ordering::SeqCst);
        limiter.global.last_refill.store(now_nanos(), Ordering::SeqCst);

        // 500 bytes at 1000 B/s = ~500ms
        let start = Instant::now();
        limiter.acquire(TaskId::new(1), 500).await;
        let elapsed = start.elapsed();

        // Generous tolerance: 250ms - 1500ms (50%-300% of expected)
        assert!(
            elapsed >= Duration::from_millis(250),
            "acquire should have waited ~500ms for tokens, took {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_millis(1500),
            "acquire took too long: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn per_task_cap_throttles_below_global() {
        let limiter = RateLimiter::new(None);
        let id = TaskId::new(7);
        limiter.set_task_limit(id, Some(1_000));

        // Drain the task bucket
        {
            let map = limiter.per_task.lock().unwrap();
            let bucket = map.get(&id).unwrap();
            bucket.tokens.store(0, Ordering::SeqCst);
            bucket.last_refill.store(now_nanos(), Ordering::SeqCst);
        }

        let start = Instant::now();
        limiter.acquire(id, 500).await;
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(250),
            "per-task cap should have throttled even with global unlimited, took {elapsed:?}"
        );

        // An uncapped task is unaffected
        let start = Instant::now();
        limiter.acquire(TaskId::new(8), 1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn clearing_task_limit_removes_throttle() {
        let limiter = RateLimiter::new(None);
        let id = TaskId::new(3);
        limiter.set_task_limit(id, Some(100));
        limiter.set_task_limit(id, None);

        let start = Instant::now();
        limiter.acquire(id, 1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn raising_global_limit_unblocks_waiting_acquire() {
        // Start with a very slow limit so acquire will block for a long time
        let limiter = RateLimiter::new(Some(100));
        limiter.global.tokens.store(0, Ordering::SeqCst);
        limiter.global.last_refill.store(now_nanos(), Ordering::SeqCst);

        let limiter_for_task = limiter.clone();

        // 1000 bytes at 100 B/s would take ~10 seconds
        let acquire_handle = tokio::spawn(async move {
            limiter_for_task.acquire(TaskId::new(1), 1_000).await;
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        limiter.set_global_limit(Some(100_000));

        let result = tokio::time::timeout(Duration::from_secs(5), acquire_handle).await;
        assert!(
            result.is_ok(),
            "acquire should complete promptly after limit increase"
        );
        result.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removing_global_limit_unblocks_waiting_acquire() {
        let limiter = RateLimiter::new(Some(1));
        limiter.global.tokens.store(0, Ordering::SeqCst);
        limiter.global.last_refill.store(now_nanos(), Ordering::SeqCst);

        let limiter_for_task = limiter.clone();
        let acquire_handle = tokio::spawn(async move {
            limiter_for_task.acquire(TaskId::new(1), 1_000_000).await;
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        limiter.set_global_limit(None);

        let result = tokio::time::timeout(Duration::from_secs(3), acquire_handle).await;
        assert!(
            result.is_ok(),
            "acquire should complete quickly after limit removed"
        );
        result.unwrap().unwrap();
    }

    #[test]
    fn clone_shares_state() {
        let original = RateLimiter::new(Some(1_000_000));
        let clone = original.clone();

        clone.set_global_limit(Some(5_000_000));
        assert_eq!(original.global_limit(), Some(5_000_000));

        original.set_global_limit(None);
        assert_eq!(clone.global_limit(), None);
    }
}
