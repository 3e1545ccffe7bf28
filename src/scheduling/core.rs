//! Scheduler Core (C7): binds the priority queue to dispatch, consulting
//! the rate limiter before each dispatch, wrapping the call in the backoff
//! driver, and recording the outcome to metrics.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::cancel::CancelToken;
use super::metrics::{MetricsCollector, PreemptReason};
use super::penalty::AdaptivePenaltyController;
use super::queue::{PriorityScheduler, TaskEntry};
use super::ratelimit::TokenBucketLimiter;
use super::retry::{classify_error, retry_with_backoff, ClassifiableError, RetryConfig, RetryError, RetryHooks};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The classified outcome of an abstract provider invocation. The core
/// never sees provider SDK wire details, only this shape.
#[derive(Debug, Clone)]
pub struct ExecutorError {
    /// An explicit status the caller already classified, if any.
    pub status: Option<u16>,
    /// Human-readable description, scanned for classification when `status`
    /// is absent.
    pub message: String,
    /// Provider-supplied retry-after hint, milliseconds.
    pub retry_after_ms: Option<u64>,
    /// Whether this failure was specifically a deadline/timeout, rather
    /// than a provider-classified status.
    pub is_timeout: bool,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExecutorError {}

impl ClassifiableError for ExecutorError {
    fn explicit_status(&self) -> Option<u16> {
        self.status
    }

    fn message(&self) -> String {
        self.message.clone()
    }
}

/// The abstract capability the core dispatches through. Implementors own
/// provider SDK details entirely; the core only sees success or a
/// classified [`ExecutorError`].
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Invoke the task described by `entry` for the given 1-based `attempt`,
    /// observing `signal` for cooperative cancellation.
    async fn invoke(&self, entry: &TaskEntry, attempt: u32, signal: CancelToken) -> Result<(), ExecutorError>;
}

/// Tunables for [`SchedulerCore`].
#[derive(Debug, Clone, Copy)]
pub struct SchedulerCoreConfig {
    /// Concurrency ceiling before the adaptive penalty is applied.
    pub base_parallelism: u32,
    /// How often the starvation promoter sweeps the queue.
    pub promote_interval_ms: u64,
    /// Backoff configuration handed to the retry driver.
    pub retry: RetryConfig,
}

impl Default for SchedulerCoreConfig {
    fn default() -> Self {
        Self {
            base_parallelism: 4,
            promote_interval_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

/// Binds C6 (queue) + C2 (limiter) + C5 (penalty) + C3 (retry) + C8 (metrics)
/// into the dispatch loop described in the scheduler's lifecycle diagram.
pub struct SchedulerCore {
    queue: Arc<PriorityScheduler>,
    limiter: Arc<TokenBucketLimiter>,
    penalty: Arc<AdaptivePenaltyController>,
    metrics: Arc<MetricsCollector>,
    executor: Arc<dyn TaskExecutor>,
    config: SchedulerCoreConfig,
    semaphore: Arc<Semaphore>,
    active_count: Arc<AtomicU32>,
    root_cancel: CancelToken,
}

impl SchedulerCore {
    /// Construct a scheduler core over existing component instances.
    pub fn new(
        queue: Arc<PriorityScheduler>,
        limiter: Arc<TokenBucketLimiter>,
        penalty: Arc<AdaptivePenaltyController>,
        metrics: Arc<MetricsCollector>,
        executor: Arc<dyn TaskExecutor>,
        config: SchedulerCoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            limiter,
            penalty,
            metrics,
            executor,
            semaphore: Arc::new(Semaphore::new(config.base_parallelism.max(1) as usize)),
            active_count: Arc::new(AtomicU32::new(0)),
            root_cancel: CancelToken::new(),
            config,
        })
    }

    /// The scheduler's own cancellation token; cancelling it stops `run`
    /// and cascades into every in-flight dispatch.
    pub fn cancel_token(&self) -> CancelToken {
        self.root_cancel.clone()
    }

    /// The underlying priority queue, for enqueueing work.
    pub fn queue(&self) -> &Arc<PriorityScheduler> {
        &self.queue
    }

    /// The metrics collector this core reports to.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Run the dispatch loop until cancelled. Spawns the starvation
    /// promoter as a sibling task and dispatches each popped entry on its
    /// own task, respecting the adaptive concurrency ceiling.
    pub async fn run(self: Arc<Self>) {
        let promoter = self.clone();
        let promoter_signal = self.root_cancel.clone();
        let promoter_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(promoter.config.promote_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let n = promoter.queue.promote_starving_tasks();
                        if n > 0 {
                            info!(promoted = n, "starvation promotion swept queue");
                        }
                    }
                    _ = promoter_signal.cancelled() => break,
                }
            }
        });

        loop {
            if self.root_cancel.is_cancelled() {
                break;
            }
            let Some(entry) = self.queue.dequeue() else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            };
            self.metrics.update_queue_stats(
                self.queue.length() as u64,
                self.active_count.load(Ordering::SeqCst) as u64,
            );
            let this = self.clone();
            tokio::spawn(async move {
                this.dispatch_one(entry).await;
            });
        }

        promoter_handle.abort();
    }

    /// Atomically check the adaptive ceiling and reserve a slot in the same
    /// step, closing the gap between "read `active_count`" and "increment
    /// it" that a plain load-then-add would leave open to concurrently
    /// dispatching tasks.
    fn try_reserve_slot(&self) -> bool {
        let effective = self.penalty.apply_limit(self.config.base_parallelism);
        self.active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if cur < effective {
                    Some(cur + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    async fn wait_for_slot(&self) -> bool {
        loop {
            if self.try_reserve_slot() {
                return true;
            }
            if self.root_cancel.is_cancelled() {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn dispatch_one(self: Arc<Self>, mut entry: TaskEntry) {
        if !self.wait_for_slot().await {
            // Never acquired a slot before the signal fired: this task was
            // blocked on concurrency pressure, not on a caller cancellation.
            self.metrics.record_preemption(&entry.id, PreemptReason::Capacity);
            return;
        }

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        loop {
            if self.root_cancel.is_cancelled() {
                self.active_count.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            let wait = self
                .limiter
                .can_proceed(&entry.provider, &entry.model, entry.cost_rounds as f64);
            if wait == 0 {
                break;
            }

            if let Some(candidate) = self.queue.peek() {
                let candidate_wait =
                    self.limiter
                        .can_proceed(&candidate.provider, &candidate.model, candidate.cost_rounds as f64);
                if candidate_wait < wait {
                    entry.skip_count += 1;
                    self.metrics.record_work_steal("core", &entry.id);
                    self.queue.requeue(entry);
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait.min(1_000))) => {}
                _ = self.root_cancel.cancelled() => {
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
        }

        self.limiter.consume(&entry.provider, &entry.model, entry.cost_rounds as f64);

        let dispatch_start = now_ms();
        let enqueue_time = entry.enqueued_at_ms;
        let provider = entry.provider.clone();
        let model = entry.model.clone();
        let executor = self.executor.clone();
        let limiter_for_gate = self.limiter.clone();
        let gate_provider = provider.clone();
        let gate_model = model.clone();
        let entry_for_exec = entry.clone();
        let retry_config = self.config.retry;
        let cancel = self.root_cancel.clone();

        let gate_closure = move || limiter_for_gate.gate_snapshot(&gate_provider, &gate_model);

        let result = retry_with_backoff(
            move |attempt, signal| {
                let executor = executor.clone();
                let entry = entry_for_exec.clone();
                async move { executor.invoke(&entry, attempt, signal).await }
            },
            retry_config,
            cancel,
            RetryHooks {
                on_retry: None,
                rate_limit_gate: Some(&gate_closure),
            },
        )
        .await;

        let execution_ms = now_ms().saturating_sub(dispatch_start);
        let waited_ms = dispatch_start.saturating_sub(enqueue_time);

        match result {
            Ok(()) => {
                self.limiter.record_success(&provider, &model);
                self.penalty.lower();
                self.metrics.record_task_completion(
                    &provider,
                    &model,
                    entry.priority,
                    waited_ms,
                    execution_ms,
                    true,
                );
            }
            Err(RetryError::Cancelled) => {
                self.metrics.record_preemption(&entry.id, PreemptReason::User);
            }
            Err(RetryError::Failed(err)) => {
                let status = classify_error(&err);
                if status == Some(429) {
                    self.limiter.record_429(&provider, &model, err.retry_after_ms);
                    self.penalty.raise("rate_limit");
                    self.metrics.record_rate_limit_hit();
                } else if err.is_timeout {
                    self.penalty.raise("timeout");
                } else if matches!(status, Some(503) | Some(502) | Some(504)) {
                    // Provider-side overload/unavailability: a capacity
                    // signal distinct from an explicit rate-limit response.
                    self.penalty.raise("capacity");
                } else {
                    warn!(task = %entry.id, error = %err, "task failed without retry");
                }
                self.metrics.record_task_completion(
                    &provider,
                    &model,
                    entry.priority,
                    waited_ms,
                    execution_ms,
                    false,
                );
            }
        }

        self.active_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::penalty::PenaltyConfig;
    use crate::scheduling::queue::{Priority, TaskMeta};
    use crate::scheduling::ratelimit::RateLimitOverride;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysSucceeds {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for AlwaysSucceeds {
        async fn invoke(&self, _entry: &TaskEntry, _attempt: u32, _signal: CancelToken) -> Result<(), ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn meta(priority: Priority) -> TaskMeta {
        TaskMeta {
            tool_name: "bash".into(),
            priority,
            cost_rounds: 1,
            cost_wall_ms: 10,
            soft_deadline_ms: None,
            source: None,
            provider: "acme".into(),
            model: "small".into(),
        }
    }

    #[tokio::test]
    async fn dispatches_enqueued_task_and_records_completion() {
        let queue = Arc::new(PriorityScheduler::new());
        let limiter = Arc::new(TokenBucketLimiter::new(RateLimitOverride {
            rpm: 6_000.0,
            burst_multiplier: 2.0,
            min_interval_ms: 0,
        }));
        let penalty = Arc::new(AdaptivePenaltyController::new(PenaltyConfig::default()));
        let metrics = MetricsCollector::new(60_000);
        let executor = Arc::new(AlwaysSucceeds { calls: AtomicUsize::new(0) });

        queue.enqueue(meta(Priority::Normal));

        let core = SchedulerCore::new(
            queue.clone(),
            limiter,
            penalty,
            metrics.clone(),
            executor.clone(),
            SchedulerCoreConfig { base_parallelism: 2, promote_interval_ms: 5_000, retry: RetryConfig::default() },
        );

        let cancel = core.cancel_token();
        let run_handle = tokio::spawn(core.clone().run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let _ = run_handle.await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        let summary = metrics.get_summary(60_000);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.success_rate, 1.0);
    }
}
