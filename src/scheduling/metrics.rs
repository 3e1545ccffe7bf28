//! In-memory rolling-window metrics: completions, preemptions, work-steals,
//! rate-limit hits, and queue occupancy, with quantile summaries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use super::queue::Priority;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

const DEFAULT_WINDOW_MS: u64 = 60_000;

/// One completed task, as recorded by [`MetricsCollector::record_task_completion`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Milliseconds the task spent queued before dispatch.
    pub wait_ms: u64,
    /// Milliseconds the dispatch itself took.
    pub execution_ms: u64,
    /// Whether the dispatch ultimately succeeded.
    pub success: bool,
    /// Provider dispatched to.
    pub provider: String,
    /// Model dispatched to.
    pub model: String,
    /// Priority class at time of dispatch.
    pub priority: Priority,
    /// Epoch ms this record was recorded.
    pub recorded_at_ms: u64,
}

/// Reason a running task was preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreemptReason {
    /// The rate limiter denied dispatch.
    RateLimit,
    /// A deadline/timeout fired.
    Timeout,
    /// Concurrency pressure forced preemption.
    Capacity,
    /// The caller requested cancellation.
    User,
}

/// Quantile + mean summary over a window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Percentiles {
    /// Arithmetic mean.
    pub mean: f64,
    /// 50th percentile.
    pub p50: f64,
    /// 99th percentile.
    pub p99: f64,
}

impl Default for Percentiles {
    fn default() -> Self {
        Self { mean: 0.0, p50: 0.0, p99: 0.0 }
    }
}

fn percentiles_of(mut values: Vec<f64>) -> Percentiles {
    if values.is_empty() {
        return Percentiles::default();
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = values.len();
    let sum: f64 = values.iter().sum();
    let mean = sum / count as f64;
    let p50 = values[count / 2];
    let p99_idx = ((count as f64 * 0.99) as usize).min(count - 1);
    let p99 = values[p99_idx];
    Percentiles { mean, p50, p99 }
}

/// A point-in-time summary over a requested period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Total completions in the window.
    pub total: usize,
    /// Successful completions / total, 0 if total is 0.
    pub success_rate: f64,
    /// Wait-time percentiles.
    pub wait: Percentiles,
    /// Execution-time percentiles.
    pub execution: Percentiles,
    /// Completions broken down by provider.
    pub by_provider: HashMap<String, usize>,
    /// Completions broken down by priority class.
    pub by_priority: HashMap<String, usize>,
}

/// Cumulative, monotonic-within-session counters.
#[derive(Debug, Default)]
pub struct RollingCounters {
    queue_depth: AtomicU64,
    active_tasks: AtomicU64,
    rate_limit_hits: AtomicU64,
    preempt_count: AtomicU64,
    preempt_rate_limit: AtomicU64,
    preempt_timeout: AtomicU64,
    preempt_capacity: AtomicU64,
    preempt_user: AtomicU64,
    steal_count: AtomicU64,
}

/// A snapshot of [`RollingCounters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Current queue occupancy.
    pub queue_depth: u64,
    /// Currently dispatched tasks.
    pub active_tasks: u64,
    /// Completions recorded in the rolling window.
    pub tasks_in_window: u64,
    /// Cumulative rate-limit denials observed.
    pub rate_limit_hits: u64,
    /// Cumulative preemptions.
    pub preempt_count: u64,
    /// Cumulative preemptions broken down by cause.
    pub preempt_by_reason: HashMap<String, u64>,
    /// Cumulative work-steal events.
    pub steal_count: u64,
    /// Wait-time percentiles over the window.
    pub wait: Percentiles,
}

struct StealRecord {
    instance: String,
    task_id: String,
    recorded_at_ms: u64,
}

/// Rolling-window metrics collector (component C8).
pub struct MetricsCollector {
    window_ms: u64,
    completions: Mutex<VecDeque<CompletionRecord>>,
    steals: Mutex<VecDeque<StealRecord>>,
    counters: RollingCounters,
    collector_task: RwLock<Option<JoinHandle<()>>>,
}

impl MetricsCollector {
    /// A fresh collector with the given rolling-window size.
    pub fn new(window_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            window_ms,
            completions: Mutex::new(VecDeque::new()),
            steals: Mutex::new(VecDeque::new()),
            counters: RollingCounters::default(),
            collector_task: RwLock::new(None),
        })
    }

    fn evict_old(&self) {
        let cutoff = now_ms().saturating_sub(self.window_ms);
        let mut completions = self.completions.lock();
        while completions.front().map(|r| r.recorded_at_ms < cutoff).unwrap_or(false) {
            completions.pop_front();
        }
        let mut steals = self.steals.lock();
        while steals.front().map(|r| r.recorded_at_ms < cutoff).unwrap_or(false) {
            steals.pop_front();
        }
    }

    /// Record a completed task. `waited_ms`/`execution_ms`/`success` are the
    /// outcome; `meta` supplies the dimensional tags.
    pub fn record_task_completion(
        &self,
        provider: &str,
        model: &str,
        priority: Priority,
        waited_ms: u64,
        execution_ms: u64,
        success: bool,
    ) {
        self.evict_old();
        self.completions.lock().push_back(CompletionRecord {
            wait_ms: waited_ms,
            execution_ms,
            success,
            provider: provider.to_string(),
            model: model.to_string(),
            priority,
            recorded_at_ms: now_ms(),
        });
    }

    /// Record a preemption of a running task, broken down by cause.
    pub fn record_preemption(&self, _task_id: &str, reason: PreemptReason) {
        self.counters.preempt_count.fetch_add(1, Ordering::SeqCst);
        let counter = match reason {
            PreemptReason::RateLimit => &self.counters.preempt_rate_limit,
            PreemptReason::Timeout => &self.counters.preempt_timeout,
            PreemptReason::Capacity => &self.counters.preempt_capacity,
            PreemptReason::User => &self.counters.preempt_user,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a work-steal event (a lower-wait task jumping ahead).
    pub fn record_work_steal(&self, instance: &str, task_id: &str) {
        self.counters.steal_count.fetch_add(1, Ordering::SeqCst);
        self.steals.lock().push_back(StealRecord {
            instance: instance.to_string(),
            task_id: task_id.to_string(),
            recorded_at_ms: now_ms(),
        });
    }

    /// Record a rate-limit denial.
    pub fn record_rate_limit_hit(&self) {
        self.counters.rate_limit_hits.fetch_add(1, Ordering::SeqCst);
    }

    /// Update the live queue-depth/active-task gauges.
    pub fn update_queue_stats(&self, depth: u64, active: u64) {
        self.counters.queue_depth.store(depth, Ordering::SeqCst);
        self.counters.active_tasks.store(active, Ordering::SeqCst);
    }

    /// A snapshot of current counters plus wait-time percentiles over the
    /// rolling window.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.evict_old();
        let completions = self.completions.lock();
        let waits: Vec<f64> = completions.iter().map(|r| r.wait_ms as f64).collect();
        MetricsSnapshot {
            queue_depth: self.counters.queue_depth.load(Ordering::SeqCst),
            active_tasks: self.counters.active_tasks.load(Ordering::SeqCst),
            tasks_in_window: completions.len() as u64,
            rate_limit_hits: self.counters.rate_limit_hits.load(Ordering::SeqCst),
            preempt_count: self.counters.preempt_count.load(Ordering::SeqCst),
            preempt_by_reason: HashMap::from([
                ("rate_limit".to_string(), self.counters.preempt_rate_limit.load(Ordering::SeqCst)),
                ("timeout".to_string(), self.counters.preempt_timeout.load(Ordering::SeqCst)),
                ("capacity".to_string(), self.counters.preempt_capacity.load(Ordering::SeqCst)),
                ("user".to_string(), self.counters.preempt_user.load(Ordering::SeqCst)),
            ]),
            steal_count: self.counters.steal_count.load(Ordering::SeqCst),
            wait: percentiles_of(waits),
        }
    }

    /// A fuller summary (success rate, breakdowns) over `period_ms`, which
    /// may be shorter than the full rolling window.
    pub fn get_summary(&self, period_ms: u64) -> MetricsSummary {
        self.evict_old();
        let cutoff = now_ms().saturating_sub(period_ms);
        let completions = self.completions.lock();
        let in_period: Vec<&CompletionRecord> =
            completions.iter().filter(|r| r.recorded_at_ms >= cutoff).collect();

        let total = in_period.len();
        let successful = in_period.iter().filter(|r| r.success).count();
        let success_rate = if total == 0 { 0.0 } else { successful as f64 / total as f64 };

        let waits: Vec<f64> = in_period.iter().map(|r| r.wait_ms as f64).collect();
        let execs: Vec<f64> = in_period.iter().map(|r| r.execution_ms as f64).collect();

        let mut by_provider: HashMap<String, usize> = HashMap::new();
        let mut by_priority: HashMap<String, usize> = HashMap::new();
        for r in &in_period {
            *by_provider.entry(r.provider.clone()).or_insert(0) += 1;
            *by_priority.entry(format!("{:?}", r.priority)).or_insert(0) += 1;
        }

        MetricsSummary {
            total,
            success_rate,
            wait: percentiles_of(waits),
            execution: percentiles_of(execs),
            by_provider,
            by_priority,
        }
    }

    /// Work-steal events still within the rolling window, most recent last.
    pub fn get_stealing_stats(&self) -> Vec<(String, String, u64)> {
        self.evict_old();
        self.steals
            .lock()
            .iter()
            .map(|s| (s.instance.clone(), s.task_id.clone(), s.recorded_at_ms))
            .collect()
    }

    /// Spawn a periodic background task that logs a summary every
    /// `interval_ms`. Calling this twice without [`Self::stop_collection`]
    /// replaces the previous task.
    pub fn start_collection(self: &Arc<Self>, interval_ms: u64) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let summary = this.get_summary(this.window_ms);
                info!(
                    total = summary.total,
                    success_rate = summary.success_rate,
                    p50_wait_ms = summary.wait.p50,
                    p99_wait_ms = summary.wait.p99,
                    "metrics summary"
                );
            }
        });
        *self.collector_task.write() = Some(handle);
    }

    /// Stop the periodic collection task started by [`Self::start_collection`].
    pub fn stop_collection(&self) {
        if let Some(handle) = self.collector_task.write().take() {
            handle.abort();
        }
    }

    /// Clear all recorded state, for test isolation.
    pub fn reset(&self) {
        self.completions.lock().clear();
        self.steals.lock().clear();
        self.counters.queue_depth.store(0, Ordering::SeqCst);
        self.counters.active_tasks.store(0, Ordering::SeqCst);
        self.counters.rate_limit_hits.store(0, Ordering::SeqCst);
        self.counters.preempt_count.store(0, Ordering::SeqCst);
        self.counters.preempt_rate_limit.store(0, Ordering::SeqCst);
        self.counters.preempt_timeout.store(0, Ordering::SeqCst);
        self.counters.preempt_capacity.store(0, Ordering::SeqCst);
        self.counters.preempt_user.store(0, Ordering::SeqCst);
        self.counters.steal_count.store(0, Ordering::SeqCst);
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.stop_collection();
    }
}

static GLOBAL: OnceCell<Arc<MetricsCollector>> = OnceCell::new();

/// Initialize the process-wide metrics singleton. Idempotent: subsequent
/// calls are no-ops and return the already-initialized instance.
pub fn init() -> Arc<MetricsCollector> {
    GLOBAL.get_or_init(|| MetricsCollector::new(DEFAULT_WINDOW_MS)).clone()
}

/// The process-wide metrics singleton, initializing it on first access.
pub fn instance() -> Arc<MetricsCollector> {
    init()
}

/// Environment-derived overrides for the metrics subsystem. Recognized
/// variables: `PI_METRICS_DIR`, `PI_METRICS_INTERVAL_MS`,
/// `PI_METRICS_MAX_FILE_SIZE`, `PI_METRICS_ENABLE_LOGGING`. Invalid values
/// are ignored and the corresponding field stays `None`/default.
#[derive(Debug, Clone, Default)]
pub struct MetricsEnvConfig {
    /// `PI_METRICS_DIR`, if set to a non-empty value.
    pub dir: Option<String>,
    /// `PI_METRICS_INTERVAL_MS`, if a positive integer.
    pub interval_ms: Option<u64>,
    /// `PI_METRICS_MAX_FILE_SIZE`, if a positive integer.
    pub max_file_size: Option<u64>,
    /// `PI_METRICS_ENABLE_LOGGING`, parsed as a truthy/falsy string.
    pub enable_logging: bool,
}

impl MetricsEnvConfig {
    /// Read from the process environment, ignoring invalid values.
    pub fn from_env() -> Self {
        let dir = std::env::var("PI_METRICS_DIR").ok().filter(|s| !s.is_empty());
        let interval_ms = std::env::var("PI_METRICS_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|v| *v > 0);
        let max_file_size = std::env::var("PI_METRICS_MAX_FILE_SIZE")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|v| *v > 0);
        let enable_logging = std::env::var("PI_METRICS_ENABLE_LOGGING")
            .ok()
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self { dir, interval_ms, max_file_size, enable_logging }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_zero_for_empty_window() {
        let collector = MetricsCollector::new(DEFAULT_WINDOW_MS);
        let summary = collector.get_summary(DEFAULT_WINDOW_MS);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[test]
    fn success_rate_within_unit_interval() {
        let collector = MetricsCollector::new(DEFAULT_WINDOW_MS);
        collector.record_task_completion("acme", "small", Priority::Normal, 10, 20, true);
        collector.record_task_completion("acme", "small", Priority::Normal, 10, 20, false);
        let summary = collector.get_summary(DEFAULT_WINDOW_MS);
        assert!(summary.success_rate >= 0.0 && summary.success_rate <= 1.0);
        assert_eq!(summary.success_rate, 0.5);
    }

    #[test]
    fn p50_never_exceeds_p99() {
        let collector = MetricsCollector::new(DEFAULT_WINDOW_MS);
        for wait in [5u64, 40, 12, 300, 8, 95, 1, 4000] {
            collector.record_task_completion("acme", "small", Priority::Normal, wait, wait, true);
        }
        let summary = collector.get_summary(DEFAULT_WINDOW_MS);
        assert!(summary.wait.p50 <= summary.wait.p99);
    }

    #[test]
    fn preemptions_are_broken_down_by_reason() {
        let collector = MetricsCollector::new(DEFAULT_WINDOW_MS);
        collector.record_preemption("t1", PreemptReason::Capacity);
        collector.record_preemption("t2", PreemptReason::Capacity);
        collector.record_preemption("t3", PreemptReason::User);
        let snap = collector.get_metrics();
        assert_eq!(snap.preempt_count, 3);
        assert_eq!(snap.preempt_by_reason["capacity"], 2);
        assert_eq!(snap.preempt_by_reason["user"], 1);
        assert_eq!(snap.preempt_by_reason["rate_limit"], 0);
    }

    #[test]
    fn reset_clears_all_state() {
        let collector = MetricsCollector::new(DEFAULT_WINDOW_MS);
        collector.record_task_completion("acme", "small", Priority::Normal, 1, 1, true);
        collector.record_rate_limit_hit();
        collector.reset();
        let snap = collector.get_metrics();
        assert_eq!(snap.tasks_in_window, 0);
        assert_eq!(snap.rate_limit_hits, 0);
    }

    #[test]
    fn env_config_ignores_invalid_values() {
        std::env::set_var("PI_METRICS_INTERVAL_MS", "not-a-number");
        let cfg = MetricsEnvConfig::from_env();
        assert_eq!(cfg.interval_ms, None);
        std::env::remove_var("PI_METRICS_INTERVAL_MS");
    }
}
