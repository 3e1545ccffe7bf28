//! Bounded-concurrency worker pool with cancellation cascade and
//! first-error semantics.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::cancel::CancelToken;

/// Options for [`run_with_concurrency_limit`].
pub struct PoolOptions {
    /// External cancellation signal. Already-aborted on entry fails fast.
    pub signal: CancelToken,
    /// Whether a worker failure cascades cancellation to its siblings.
    /// Defaults to `true`.
    pub abort_on_error: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            signal: CancelToken::new(),
            abort_on_error: true,
        }
    }
}

/// Errors surfaced by the concurrency pool.
#[derive(Debug, Error)]
pub enum PoolError<E> {
    /// The signal was already aborted on entry, or aborted during execution
    /// with no worker error having been recorded first.
    #[error("concurrency pool aborted")]
    Cancelled,
    /// The first worker failure observed. Additional failures are discarded.
    #[error("worker failed: {0}")]
    Worker(#[source] E),
}

/// `effectiveLimit = clamp(floor(limit), 1, len)`. Non-finite and
/// non-positive limits normalize to 1; `+inf` normalizes to `len`.
fn normalize_limit(limit: f64, len: usize) -> usize {
    if len == 0 {
        return 1;
    }
    if !limit.is_finite() {
        return if limit > 0.0 { len } else { 1 };
    }
    if limit <= 0.0 {
        return 1;
    }
    (limit.floor() as usize).clamp(1, len)
}

/// Run `worker(item, index, signal)` over `items` with at most
/// `effective_limit` concurrently in flight. `results[i]` corresponds to
/// `items[i]` regardless of completion order. Empty input returns an empty
/// vec without invoking `worker`.
pub async fn run_with_concurrency_limit<I, W, Fut, T, E>(
    items: Vec<I>,
    limit: f64,
    worker: W,
    opts: PoolOptions,
) -> Result<Vec<T>, PoolError<E>>
where
    I: Send + 'static,
    W: Fn(I, usize, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }

    if opts.signal.is_cancelled() {
        return Err(PoolError::Cancelled);
    }

    let effective_limit = normalize_limit(limit, items.len());
    let semaphore = Arc::new(Semaphore::new(effective_limit));
    let worker = Arc::new(worker);

    // The pool's own abort signal: a child of the caller's, so an external
    // cancel cascades in, but the pool cancelling it on worker failure never
    // reaches back up to the caller's signal.
    let internal = opts.signal.child();
    let internal_token = internal.token();

    let first_error: Arc<Mutex<Option<E>>> = Arc::new(Mutex::new(None));
    let n = items.len();
    let mut results: Vec<Option<T>> = (0..n).map(|_| None).collect();

    let mut set: JoinSet<(usize, Result<T, E>)> = JoinSet::new();
    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let worker = worker.clone();
        let signal = internal_token.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let result = worker(item, index, signal).await;
            (index, result)
        });
    }

    while let Some(joined) = set.join_next().await {
        let (index, result) = joined.expect("worker task panicked");
        match result {
            Ok(v) => results[index] = Some(v),
            Err(e) => {
                let mut slot = first_error.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
                if opts.abort_on_error {
                    internal.token().cancel();
                }
            }
        }
    }

    internal.detach();

    if let Some(e) = first_error.lock().take() {
        return Err(PoolError::Worker(e));
    }
    if opts.signal.is_cancelled() {
        return Err(PoolError::Cancelled);
    }

    Ok(results.into_iter().map(|r| r.expect("every index completed")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn empty_input_returns_empty_without_calling_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<Vec<i32>, PoolError<()>> = run_with_concurrency_limit(
            Vec::<i32>::new(),
            4.0,
            move |x: i32, _i, _s| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async move { Ok(x) }
            },
            PoolOptions::default(),
        )
        .await;
        assert_eq!(result.unwrap(), Vec::<i32>::new());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn result_order_matches_input_order_regardless_of_completion_order() {
        let items = vec![100u64, 50, 200, 10];
        let result = run_with_concurrency_limit(
            items,
            4.0,
            |x: u64, _i, _s| async move {
                tokio::time::sleep(Duration::from_millis(x)).await;
                Ok::<u64, ()>(x)
            },
            PoolOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(result, vec![100, 50, 200, 10]);
    }

    #[tokio::test]
    async fn cascades_cancellation_on_first_error() {
        let items = vec![1i32, 2, 3];
        let observed_abort = Arc::new(AtomicUsize::new(0));
        let observed_abort2 = observed_abort.clone();
        let result: Result<Vec<i32>, PoolError<&'static str>> = run_with_concurrency_limit(
            items,
            3.0,
            move |x, _i, signal| {
                let observed_abort = observed_abort2.clone();
                async move {
                    if x == 1 {
                        return Err("boom");
                    }
                    // Give the abort a chance to propagate before the
                    // sibling would otherwise finish.
                    for _ in 0..50 {
                        if signal.is_cancelled() {
                            observed_abort.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    Ok(x)
                }
            },
            PoolOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(PoolError::Worker("boom"))));
        assert!(observed_abort.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn already_cancelled_signal_fails_immediately() {
        let signal = CancelToken::new();
        signal.cancel();
        let result: Result<Vec<i32>, PoolError<()>> = run_with_concurrency_limit(
            vec![1, 2, 3],
            4.0,
            |x: i32, _i, _s| async move { Ok(x) },
            PoolOptions { signal, abort_on_error: true },
        )
        .await;
        assert!(matches!(result, Err(PoolError::Cancelled)));
    }

    #[test]
    fn limit_normalization() {
        assert_eq!(normalize_limit(4.0, 10), 4);
        assert_eq!(normalize_limit(0.0, 10), 1);
        assert_eq!(normalize_limit(-5.0, 10), 1);
        assert_eq!(normalize_limit(f64::INFINITY, 10), 10);
        assert_eq!(normalize_limit(f64::NAN, 10), 1);
        assert_eq!(normalize_limit(100.0, 3), 3);
    }
}
