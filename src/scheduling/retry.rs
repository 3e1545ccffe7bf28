//! Exponential-with-jitter backoff, error classification, and a cancellable
//! retry driver.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use super::cancel::CancelToken;
use super::ratelimit::RateLimitGateSnapshot;

/// Implemented by the error type an `op` closure fails with, so the driver
/// can classify it without depending on any particular HTTP client.
pub trait ClassifiableError {
    /// An explicit numeric status the error already carries, if any. Takes
    /// priority over message parsing.
    fn explicit_status(&self) -> Option<u16> {
        None
    }

    /// The error's human-readable message, scanned for status tokens and
    /// rate-limit phrases when no explicit status is present.
    fn message(&self) -> String;
}

/// Extract a status code: explicit field first, then message parsing, else
/// `None` ("unknown").
pub fn classify_error<E: ClassifiableError>(err: &E) -> Option<u16> {
    if let Some(status) = err.explicit_status() {
        return Some(status);
    }
    let msg = err.message().to_ascii_lowercase();
    for code in [429u16, 500, 401, 403] {
        if msg.contains(&code.to_string()) {
            return Some(code);
        }
    }
    if msg.contains("rate limit") || msg.contains("too many requests") || msg.contains("quota exceeded") {
        return Some(429);
    }
    None
}

/// Whether a classified status code should be retried.
pub fn is_retryable(status: Option<u16>) -> bool {
    matches!(status, Some(429) | Some(500) | Some(502) | Some(503) | Some(504))
}

/// Jitter strategy applied to the computed backoff base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Use the base delay as-is.
    None,
    /// Uniform random in `[base/2, base]`.
    Partial,
    /// Uniform random in `[1, base]`.
    Full,
}

/// Backoff configuration. Invalid values are silently clamped to a valid
/// range rather than rejected, matching the rest of this crate's
/// configuration-parsing discipline.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt, in `[0, 20]`.
    pub max_retries: u32,
    /// Delay for the first retry, in milliseconds, `≥1`.
    pub initial_delay_ms: u64,
    /// Ceiling on the computed delay, `≥ initial_delay_ms`.
    pub max_delay_ms: u64,
    /// Growth factor per attempt, in `[1.0, 10.0]`.
    pub multiplier: f64,
    /// Jitter strategy.
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: Jitter::Full,
        }
    }
}

impl RetryConfig {
    /// Clamp all fields into their valid ranges.
    pub fn normalized(mut self) -> Self {
        self.max_retries = self.max_retries.min(20);
        self.initial_delay_ms = self.initial_delay_ms.max(1);
        self.multiplier = self.multiplier.clamp(1.0, 10.0);
        if self.max_delay_ms < self.initial_delay_ms {
            self.max_delay_ms = self.initial_delay_ms;
        }
        self
    }
}

/// `base = min(initial * multiplier^(attempt-1), max_delay_ms)`, then jitter.
/// `attempt` is 1-based. Always returns a value in `(0, cfg.max_delay_ms]`.
pub fn compute_backoff_delay_ms(attempt: u32, cfg: &RetryConfig) -> u64 {
    let cfg = cfg.normalized();
    let exp = (attempt.saturating_sub(1)) as i32;
    let base = (cfg.initial_delay_ms as f64 * cfg.multiplier.powi(exp)).min(cfg.max_delay_ms as f64);
    let base = base.max(1.0);

    let delay = match cfg.jitter {
        Jitter::None => base,
        Jitter::Partial => rand::thread_rng().gen_range((base / 2.0)..=base),
        Jitter::Full => rand::thread_rng().gen_range(1.0..=base),
    };
    delay.round().max(1.0) as u64
}

/// Errors surfaced by [`retry_with_backoff`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The cancellation token fired before or during a retry sleep, or was
    /// already cancelled on entry (in which case `op` was never called).
    #[error("retry aborted")]
    Cancelled,
    /// Retries were exhausted (or the error was non-retryable); carries the
    /// last attempt's error.
    #[error("operation failed: {0}")]
    Failed(#[source] E),
}

/// Optional hooks around [`retry_with_backoff`].
#[derive(Default)]
pub struct RetryHooks<'a, E> {
    /// Called before each inter-attempt sleep with `(attempt, delay_ms, err)`.
    pub on_retry: Option<&'a dyn Fn(u32, u64, &E)>,
    /// Read-only rate-limit gate consulted on a 429 classification, so a
    /// retry that would be immediately denied waits out the penalty window
    /// instead of burning an attempt.
    pub rate_limit_gate: Option<&'a dyn Fn() -> RateLimitGateSnapshot>,
}

/// Call `op(attempt, cancel)` (1-based attempt), retrying on classified
/// transient failures with exponential-plus-jitter backoff.
pub async fn retry_with_backoff<Op, Fut, T, E>(
    mut op: Op,
    cfg: RetryConfig,
    cancel: CancelToken,
    hooks: RetryHooks<'_, E>,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32, CancelToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ClassifiableError,
{
    let cfg = cfg.normalized();

    if cancel.is_cancelled() {
        return Err(RetryError::Cancelled);
    }

    let mut attempt: u32 = 1;
    loop {
        let result = op(attempt, cancel.clone()).await;
        match result {
            Ok(v) => return Ok(v),
            Err(err) => {
                let status = classify_error(&err);
                let retryable = is_retryable(status);
                if !retryable || attempt > cfg.max_retries {
                    return Err(RetryError::Failed(err));
                }

                let mut delay_ms = compute_backoff_delay_ms(attempt, &cfg);
                if status == Some(429) {
                    if let Some(gate) = hooks.rate_limit_gate {
                        let snapshot = gate();
                        delay_ms = delay_ms.max(snapshot.retry_after_in_ms);
                    }
                }

                if let Some(on_retry) = hooks.on_retry {
                    on_retry(attempt, delay_ms, &err);
                }
                warn!(attempt, delay_ms, "retrying after transient failure");

                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                }

                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        status: Option<u16>,
        message: String,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)
        }
    }
    impl std::error::Error for TestError {}

    impl ClassifiableError for TestError {
        fn explicit_status(&self) -> Option<u16> {
            self.status
        }
        fn message(&self) -> String {
            self.message.clone()
        }
    }

    #[test]
    fn classify_prefers_explicit_status() {
        let err = TestError { status: Some(500), message: "rate limit".to_string() };
        assert_eq!(classify_error(&err), Some(500));
    }

    #[test]
    fn classify_falls_back_to_message_phrases() {
        let err = TestError { status: None, message: "Too Many Requests".to_string() };
        assert_eq!(classify_error(&err), Some(429));
    }

    #[test]
    fn classify_unknown_on_no_signal() {
        let err = TestError { status: None, message: "disk full".to_string() };
        assert_eq!(classify_error(&err), None);
    }

    #[test]
    fn backoff_delay_is_bounded() {
        let cfg = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            jitter: Jitter::None,
        };
        for attempt in 1..=10 {
            let d = compute_backoff_delay_ms(attempt, &cfg);
            assert!(d > 0 && d <= cfg.max_delay_ms);
        }
    }

    #[test]
    fn max_delay_below_initial_is_raised_to_match() {
        let cfg = RetryConfig {
            max_retries: 1,
            initial_delay_ms: 500,
            max_delay_ms: 10, // invalid: below initial
            multiplier: 2.0,
            jitter: Jitter::None,
        };
        let d = compute_backoff_delay_ms(1, &cfg);
        assert_eq!(d, 500);
    }

    #[tokio::test]
    async fn fails_then_succeeds_after_one_retry() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig {
            max_retries: 3,
            initial_delay_ms: 5,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: Jitter::None,
        };
        let result = retry_with_backoff(
            |_attempt, _cancel| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TestError { status: Some(500), message: "boom".into() })
                    } else {
                        Ok::<_, TestError>("ok")
                    }
                }
            },
            cfg,
            CancelToken::new(),
            RetryHooks::default(),
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn already_cancelled_never_calls_op() {
        let calls = AtomicU32::new(0);
        let cancel = CancelToken::new();
        cancel.cancel();
        let cfg = RetryConfig::default();
        let result: Result<&str, RetryError<TestError>> = retry_with_backoff(
            |_attempt, _cancel| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok("unreachable") }
            },
            cfg,
            cancel,
            RetryHooks::default(),
        )
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::default();
        let result = retry_with_backoff(
            |_attempt, _cancel| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<&str, _>(TestError { status: Some(404), message: "missing".into() }) }
            },
            cfg,
            CancelToken::new(),
            RetryHooks::default(),
        )
        .await;
        assert!(matches!(result, Err(RetryError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
