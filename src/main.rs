//! Demonstration binary exercising the scheduling runtime end to end.
//!
//! Wires a stub provider into a [`SchedulerCore`], enqueues a handful of
//! tasks across priority classes, lets the dispatch loop run briefly, and
//! prints a metrics summary. This is not a production CLI; it exists to
//! drive the library the way an embedding application would.

use std::sync::Arc;
use std::time::Duration;

use agentsched::config::SchedulerConfig;
use agentsched::scheduling::{
    CancelToken, MetricsCollector, Priority, PriorityScheduler, SchedulerCore, TaskEntry, TaskExecutor, TaskMeta,
    TokenBucketLimiter,
};
use agentsched::scheduling::penalty::AdaptivePenaltyController;
use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct StubExecutor;

#[async_trait]
impl TaskExecutor for StubExecutor {
    async fn invoke(
        &self,
        entry: &TaskEntry,
        _attempt: u32,
        _signal: CancelToken,
    ) -> Result<(), agentsched::scheduling::ExecutorError> {
        tokio::time::sleep(Duration::from_millis(entry.cost_wall_ms.min(50))).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    info!(version = agentsched::VERSION, "starting scheduler demo");

    let config = SchedulerConfig::from_env();

    let queue = Arc::new(PriorityScheduler::new());
    let limiter = Arc::new(TokenBucketLimiter::new(config.rate_limit.to_override()));
    let penalty = Arc::new(AdaptivePenaltyController::new(config.penalty.to_penalty_config()));
    let metrics = MetricsCollector::new(60_000);
    let executor = Arc::new(StubExecutor);

    let samples = [
        ("question", Priority::Critical),
        ("bash", Priority::Normal),
        ("subagent_team", Priority::High),
        ("background_scan", Priority::Background),
        ("retry_fetch", Priority::Low),
    ];

    for (tool_name, priority) in samples {
        queue.enqueue(TaskMeta {
            tool_name: tool_name.to_string(),
            priority,
            cost_rounds: 2,
            cost_wall_ms: 20,
            soft_deadline_ms: None,
            source: None,
            provider: "acme".to_string(),
            model: "small".to_string(),
        });
    }

    let core = SchedulerCore::new(queue, limiter, penalty, metrics.clone(), executor, config.core_config());
    let cancel = core.cancel_token();
    let run_handle = tokio::spawn(core.run());

    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();
    let _ = run_handle.await;

    let summary = metrics.get_summary(60_000);
    info!(
        total = summary.total,
        success_rate = summary.success_rate,
        p50_wait_ms = summary.wait.p50,
        p99_wait_ms = summary.wait.p99,
        "demo run complete"
    );

    Ok(())
}
