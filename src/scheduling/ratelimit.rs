//! Per-(provider, model) token-bucket admission control with burst headroom
//! and adaptive 429 recovery.
//!
//! Unlike the network-facing algorithms this is adapted from, this limiter
//! never denies outright: `can_proceed` only ever advises a wait. Buckets
//! are created lazily and the tracked set is LRU-capped so a long-running
//! process with a churning set of (provider, model) pairs doesn't grow
//! unbounded.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

const MAX_TRACKED_BUCKETS: usize = 512;
const DEFAULT_BURST_MULTIPLIER: f64 = 2.0;
const DEFAULT_MIN_INTERVAL_MS: u64 = 100;
const MAX_RETRY_AFTER_MS: u64 = 10 * 60_000;
const DEFAULT_RETRY_AFTER_MS: u64 = 60_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Normalizes a (provider, model) pair into the bucket map key: lowercased,
/// trimmed, blank collapses to `"global"`.
fn normalize_key(provider: &str, model: &str) -> String {
    let provider = provider.trim().to_ascii_lowercase();
    let model = model.trim().to_ascii_lowercase();
    if provider.is_empty() && model.is_empty() {
        return "global".to_string();
    }
    format!("{}:{}", provider, model)
}

/// Per-(provider, model) override of the limiter's defaults.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitOverride {
    /// Requests per minute the base bucket refills toward.
    pub rpm: f64,
    /// Multiple of capacity the bucket may burst to (≥1.0).
    pub burst_multiplier: f64,
    /// Minimum spacing enforced between dispatches.
    pub min_interval_ms: u64,
}

impl Default for RateLimitOverride {
    fn default() -> Self {
        Self {
            rpm: 60.0,
            burst_multiplier: DEFAULT_BURST_MULTIPLIER,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
        }
    }
}

struct Bucket {
    capacity: f64,
    refill_rate: f64, // tokens/sec
    tokens_available: f64,
    burst_tokens_used: f64,
    burst_multiplier: f64,
    default_burst_multiplier: f64,
    last_refill_ms: u64,
    last_dispatch_ms: u64,
    retry_after_until_ms: u64,
    min_interval_ms: u64,
}

impl Bucket {
    fn new(over: RateLimitOverride) -> Self {
        let refill_rate = over.rpm / 60.0;
        let capacity = over.rpm.max(1.0);
        Self {
            capacity,
            refill_rate,
            tokens_available: capacity,
            burst_tokens_used: 0.0,
            burst_multiplier: over.burst_multiplier.max(1.0),
            default_burst_multiplier: over.burst_multiplier.max(1.0),
            last_refill_ms: now_ms(),
            last_dispatch_ms: 0,
            retry_after_until_ms: 0,
            min_interval_ms: over.min_interval_ms,
        }
    }

    fn refill(&mut self, now: u64) {
        if now > self.last_refill_ms {
            let delta_secs = (now - self.last_refill_ms) as f64 / 1000.0;
            self.tokens_available =
                (self.tokens_available + delta_secs * self.refill_rate).min(self.capacity);
        }
        self.last_refill_ms = now;
    }

    fn can_proceed(&mut self, tokens_needed: f64) -> u64 {
        let now = now_ms();
        self.refill(now);

        if now < self.retry_after_until_ms {
            return self.retry_after_until_ms - now;
        }

        if self.last_dispatch_ms > 0 {
            let since_dispatch = now.saturating_sub(self.last_dispatch_ms);
            if since_dispatch < self.min_interval_ms {
                return self.min_interval_ms - since_dispatch;
            }
        }

        if self.tokens_available >= tokens_needed {
            return 0;
        }

        let burst_headroom =
            self.capacity * self.burst_multiplier - self.capacity - self.burst_tokens_used;
        if burst_headroom >= tokens_needed - self.tokens_available {
            return 0;
        }

        let shortfall = tokens_needed - self.tokens_available;
        if self.refill_rate <= 0.0 {
            return u64::MAX;
        }
        ((shortfall / self.refill_rate) * 1000.0).ceil() as u64
    }

    fn consume(&mut self, tokens: f64) {
        let now = now_ms();
        self.refill(now);
        if self.tokens_available >= tokens {
            self.tokens_available -= tokens;
        } else {
            let remainder = tokens - self.tokens_available;
            self.tokens_available = 0.0;
            self.burst_tokens_used += remainder;
        }
        self.last_dispatch_ms = now;
    }

    fn record_429(&mut self, retry_after_ms: Option<u64>) {
        let now = now_ms();
        let requested = retry_after_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS);
        let clamped = requested.min(MAX_RETRY_AFTER_MS);
        self.retry_after_until_ms = now + clamped;
        self.burst_multiplier = (self.burst_multiplier * 0.8).max(1.0);
    }

    fn record_success(&mut self) {
        self.burst_tokens_used = (self.burst_tokens_used * 0.9).max(0.0);
        if self.burst_multiplier < self.default_burst_multiplier {
            self.burst_multiplier =
                (self.burst_multiplier + (self.default_burst_multiplier - self.burst_multiplier) * 0.1)
                    .min(self.default_burst_multiplier);
        }
    }
}

/// A read-only view of a bucket's current gate, used by the retry driver to
/// avoid fast-retrying a request the limiter would just deny again.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitGateSnapshot {
    /// Milliseconds until the bucket's 429 penalty window clears (0 if none).
    pub retry_after_in_ms: u64,
    /// Tokens currently available in the base bucket.
    pub tokens_available: f64,
}

/// Per-(provider, model) token-bucket limiter. Cheap to clone; internal
/// state is behind a lock-protected LRU so cloning shares the map.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    buckets: Arc<Mutex<LruCache<String, Arc<Mutex<Bucket>>>>>,
    default_override: RateLimitOverride,
    overrides: Arc<Mutex<std::collections::HashMap<String, RateLimitOverride>>>,
}

impl TokenBucketLimiter {
    /// Create a limiter whose buckets fall back to `default_override` unless
    /// a (provider, model) specific override was registered.
    pub fn new(default_override: RateLimitOverride) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_BUCKETS).unwrap(),
            ))),
            default_override,
            overrides: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }
    }

    /// Register a per-(provider, model) override, applied to the bucket the
    /// next time it is created (existing buckets are not retroactively
    /// resized).
    pub fn set_override(&self, provider: &str, model: &str, over: RateLimitOverride) {
        let key = normalize_key(provider, model);
        self.overrides.lock().insert(key, over);
    }

    fn with_bucket<R>(&self, provider: &str, model: &str, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let key = normalize_key(provider, model);
        let mut buckets = self.buckets.lock();
        if let Some(b) = buckets.get(&key) {
            let b = b.clone();
            drop(buckets);
            let mut guard = b.lock();
            return f(&mut guard);
        }
        let over = self
            .overrides
            .lock()
            .get(&key)
            .copied()
            .unwrap_or(self.default_override);
        let bucket = Arc::new(Mutex::new(Bucket::new(over)));
        buckets.put(key, bucket.clone());
        drop(buckets);
        let mut guard = bucket.lock();
        f(&mut guard)
    }

    /// Non-negative milliseconds to wait before `tokens_needed` could be
    /// admitted; 0 means admissible now.
    pub fn can_proceed(&self, provider: &str, model: &str, tokens_needed: f64) -> u64 {
        self.with_bucket(provider, model, |b| b.can_proceed(tokens_needed))
    }

    /// Deduct `tokens`, dipping into burst headroom if the base bucket is
    /// exhausted.
    pub fn consume(&self, provider: &str, model: &str, tokens: f64) {
        self.with_bucket(provider, model, |b| b.consume(tokens));
    }

    /// Record a 429, opening a penalty window and shrinking burst headroom.
    pub fn record_429(&self, provider: &str, model: &str, retry_after_ms: Option<u64>) {
        self.with_bucket(provider, model, |b| b.record_429(retry_after_ms));
    }

    /// Record a success, decaying burst usage and restoring burst multiplier.
    pub fn record_success(&self, provider: &str, model: &str) {
        self.with_bucket(provider, model, |b| b.record_success());
    }

    /// Read-only snapshot of a bucket's gate, for the retry driver.
    pub fn gate_snapshot(&self, provider: &str, model: &str) -> RateLimitGateSnapshot {
        self.with_bucket(provider, model, |b| {
            let now = now_ms();
            RateLimitGateSnapshot {
                retry_after_in_ms: b.retry_after_until_ms.saturating_sub(now),
                tokens_available: b.tokens_available,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> TokenBucketLimiter {
        TokenBucketLimiter::new(RateLimitOverride {
            rpm: 600.0, // 10 tokens/sec
            burst_multiplier: 2.0,
            min_interval_ms: 0,
        })
    }

    #[test]
    fn tokens_available_stays_within_capacity() {
        let lim = limiter();
        assert!(lim.can_proceed("p", "m", 1.0) == 0);
        lim.consume("p", "m", 1.0);
        let snap = lim.gate_snapshot("p", "m");
        assert!(snap.tokens_available >= 0.0);
        assert!(snap.tokens_available <= 600.0);
    }

    #[test]
    fn wait_ms_is_never_negative() {
        let lim = limiter();
        // Drain far past capacity via burst headroom and beyond.
        lim.consume("p", "m", 10_000.0);
        let wait = lim.can_proceed("p", "m", 10_000.0);
        assert!(wait > 0);
    }

    #[test]
    fn record_429_forces_positive_wait_bounded_by_retry_after() {
        let lim = limiter();
        lim.record_429("p", "m", Some(5_000));
        let wait = lim.can_proceed("p", "m", 1.0);
        assert!(wait > 0 && wait <= 5_000);
    }

    #[test]
    fn record_429_reduces_burst_multiplier_floored_at_one() {
        let lim = limiter();
        for _ in 0..50 {
            lim.record_429("p", "m", Some(0));
        }
        // burst_multiplier should have floored at 1.0, not gone negative or
        // oscillated below it; re-check via gate snapshot behavior staying
        // sane (tokens_available bounded).
        let snap = lim.gate_snapshot("p", "m");
        assert!(snap.tokens_available >= 0.0);
    }

    #[test]
    fn blank_provider_and_model_normalize_to_global() {
        let lim = limiter();
        lim.consume("", "", 1.0);
        let snap_blank = lim.gate_snapshot("", "");
        let snap_global = lim.gate_snapshot("GLOBAL", "");
        // Both keys should route to buckets independently created from
        // defaults; at minimum neither panics and both report sane state.
        assert!(snap_blank.tokens_available >= 0.0);
        assert!(snap_global.tokens_available >= 0.0);
    }
}
