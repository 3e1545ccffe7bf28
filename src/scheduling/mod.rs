//! Core scheduling and flow-control runtime.
//!
//! This module implements the subsystem that dispatches heterogeneous
//! tasks against rate-limited providers under bounded concurrency:
//!
//! ## Storage lock
//! - Exclusive file-based mutual exclusion with dead/stale-holder recovery
//! - Atomic write-then-rename for shared on-disk state
//!
//! ## Rate limiting
//! - Per-(provider, model) token buckets with burst headroom
//! - Adaptive recovery after 429s, LRU-capped bucket map
//!
//! ## Retry
//! - Status classification from explicit fields or message parsing
//! - Exponential-with-jitter backoff, cancellable inter-attempt sleeps
//!
//! ## Concurrency
//! - Bounded-fan-out worker pool with cancellation cascade
//! - Adaptive penalty controller that shrinks effective concurrency under
//!   pressure and decays back to zero
//!
//! ## Priority queue
//! - Five-class priority queue, FIFO within class
//! - Starvation promotion and a skip-count override for anti-starvation
//!
//! ## Scheduler core
//! - Binds the queue to dispatch, consulting the limiter before each
//!   dispatch and recording outcomes to metrics
//!
//! ## Metrics
//! - Rolling-window completions, quantile summaries, work-steal/preemption
//!   counters
//!
//! ## Cancellation
//! - A tree of cancellation tokens with parent-child linkage
//!
//! # Examples
//!
//! ## Enqueueing and dispatching a task
//!
//! ```rust,no_run
//! use agentsched::scheduling::queue::{Priority, PriorityScheduler, TaskMeta};
//! use agentsched::scheduling::ratelimit::{RateLimitOverride, TokenBucketLimiter};
//! use agentsched::scheduling::penalty::{AdaptivePenaltyController, PenaltyConfig};
//! use agentsched::scheduling::metrics::MetricsCollector;
//! use agentsched::scheduling::core::{SchedulerCore, SchedulerCoreConfig};
//! use std::sync::Arc;
//!
//! # async fn example(executor: Arc<dyn agentsched::scheduling::core::TaskExecutor>) {
//! let queue = Arc::new(PriorityScheduler::new());
//! let limiter = Arc::new(TokenBucketLimiter::new(RateLimitOverride::default()));
//! let penalty = Arc::new(AdaptivePenaltyController::new(PenaltyConfig::default()));
//! let metrics = MetricsCollector::new(60_000);
//!
//! queue.enqueue(TaskMeta {
//!     tool_name: "bash".to_string(),
//!     priority: Priority::Normal,
//!     cost_rounds: 2,
//!     cost_wall_ms: 500,
//!     soft_deadline_ms: None,
//!     source: None,
//!     provider: "acme".to_string(),
//!     model: "small".to_string(),
//! });
//!
//! let core = SchedulerCore::new(queue, limiter, penalty, metrics, executor, SchedulerCoreConfig::default());
//! let cancel = core.cancel_token();
//! tokio::spawn(core.run());
//! # let _ = cancel;
//! # }
//! ```

pub mod cancel;
pub mod core;
pub mod lock;
pub mod metrics;
pub mod penalty;
pub mod pool;
pub mod queue;
pub mod ratelimit;
pub mod retry;

pub use cancel::{create_child, CancelToken, Cleanup};

pub use lock::{acquire_file_lock, atomic_write_text_file, with_file_lock, LockConfig, LockError, LockResult};

pub use ratelimit::{RateLimitGateSnapshot, RateLimitOverride, TokenBucketLimiter};

pub use retry::{
    classify_error, compute_backoff_delay_ms, is_retryable, retry_with_backoff, ClassifiableError, Jitter,
    RetryConfig, RetryError, RetryHooks,
};

pub use pool::{run_with_concurrency_limit, PoolError, PoolOptions};

pub use penalty::{AdaptivePenaltyController, PenaltyConfig};

pub use queue::{
    compare_priority, estimate_cost_rounds, infer_priority, infer_task_kind, CostContext, InferContext,
    Priority, PriorityScheduler, QueueStats, SourceTag, TaskEntry, TaskKind, TaskMeta,
};

pub use core::{ExecutorError, SchedulerCore, SchedulerCoreConfig, TaskExecutor};

pub use metrics::{
    MetricsCollector, MetricsEnvConfig, MetricsSnapshot, MetricsSummary, Percentiles, PreemptReason,
};
