//! Five-class priority queue with FIFO-within-class ordering, a starvation
//! override for long-skipped entries, and a periodic promoter for
//! long-waiting low-priority work.
//!
//! The dequeue comparator is a deliberate weak ordering: the skip-count
//! starvation override (rule 1 below) is not transitive with the priority
//! and FIFO tiebreaks. A fully transitive comparator would have to drop that
//! override and rely solely on [`PriorityScheduler::promote_starving_tasks`],
//! which would weaken the anti-starvation guarantee in the window between
//! promoter sweeps. The weak ordering is kept deliberately rather than
//! "fixed"; see DESIGN.md.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SKIP_COUNT_OVERRIDE_THRESHOLD: i64 = 3;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Priority class. Ordinal order is `Background < Low < Normal < High <
/// Critical`; integer priority values are 0:1:2:3:4 and weights 0.5:1:2:5:10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Weight 0.5, integer value 0.
    Background,
    /// Weight 1, integer value 1.
    Low,
    /// Weight 2, integer value 2.
    Normal,
    /// Weight 5, integer value 3.
    High,
    /// Weight 10, integer value 4.
    Critical,
}

impl Priority {
    /// Integer priority value used by the comparator (higher wins).
    pub fn value(self) -> u8 {
        match self {
            Priority::Background => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    /// Weight used for virtual-finish-time fairness.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Background => 0.5,
            Priority::Low => 1.0,
            Priority::Normal => 2.0,
            Priority::High => 5.0,
            Priority::Critical => 10.0,
        }
    }

    /// One class upward, or `None` if already `Critical`.
    pub fn promoted(self) -> Option<Priority> {
        match self {
            Priority::Background => Some(Priority::Low),
            Priority::Low => Some(Priority::Normal),
            Priority::Normal => Some(Priority::High),
            Priority::High => Some(Priority::Critical),
            Priority::Critical => None,
        }
    }

    /// Wait threshold after which a task of this class is eligible for
    /// starvation promotion. `None` for `Critical` (nothing above it).
    ///
    /// Two concrete values are fixed (low: 60s, background: 120s, scaled by
    /// priority); the remaining classes are interpolated here rather than
    /// left unspecified. See DESIGN.md.
    pub fn starvation_threshold_ms(self) -> Option<u64> {
        match self {
            Priority::Background => Some(120_000),
            Priority::Low => Some(60_000),
            Priority::Normal => Some(90_000),
            Priority::High => Some(150_000),
            Priority::Critical => None,
        }
    }
}

/// Where a task originated, used by cost/priority inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTag {
    /// Enqueued in direct response to interactive user input.
    UserInteractive,
    /// Enqueued by a background process.
    Background,
    /// Enqueued by a cron-like scheduled trigger.
    Scheduled,
    /// Re-enqueued after a prior failed attempt.
    Retry,
}

/// Caller-supplied fields for [`PriorityScheduler::enqueue`].
#[derive(Debug, Clone)]
pub struct TaskMeta {
    /// Name of the tool/operation this task will invoke.
    pub tool_name: String,
    /// Priority class assigned at enqueue time.
    pub priority: Priority,
    /// Estimated cost in scheduling rounds, clamped to `[1, 50]`.
    pub cost_rounds: u32,
    /// Estimated wall-clock cost in milliseconds.
    pub cost_wall_ms: u64,
    /// Optional soft deadline, epoch milliseconds.
    pub soft_deadline_ms: Option<u64>,
    /// Optional origin tag.
    pub source: Option<SourceTag>,
    /// Provider this task will be dispatched against.
    pub provider: String,
    /// Model this task will be dispatched against.
    pub model: String,
}

/// A queued task, including scheduler-owned bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Opaque identity, assigned at enqueue.
    pub id: String,
    /// Name of the tool/operation this task will invoke.
    pub tool_name: String,
    /// Priority class. Mutated only by the starvation promoter.
    pub priority: Priority,
    /// Estimated cost in scheduling rounds.
    pub cost_rounds: u32,
    /// Estimated wall-clock cost in milliseconds.
    pub cost_wall_ms: u64,
    /// Optional soft deadline, epoch milliseconds.
    pub soft_deadline_ms: Option<u64>,
    /// Epoch milliseconds at enqueue.
    pub enqueued_at_ms: u64,
    /// Optional origin tag.
    pub source: Option<SourceTag>,
    /// Provider this task will be dispatched against.
    pub provider: String,
    /// Model this task will be dispatched against.
    pub model: String,
    /// `max(system_virtual_time, last_finish_of_class)` at enqueue.
    pub virtual_start_time: f64,
    /// `virtual_start_time + cost_rounds / weight(priority)`.
    pub virtual_finish_time: f64,
    /// Times this entry has been passed over while considering others.
    pub skip_count: u32,
    /// Epoch milliseconds the scheduler last looked at this entry.
    pub last_considered_ms: u64,
}

/// Snapshot of queue depth broken down by priority class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Total entries across all classes.
    pub total: usize,
    /// Entry count per priority class.
    pub by_priority: HashMap<String, usize>,
}

/// Total-order comparator for dequeue selection. `Ordering::Less` means `a`
/// is dequeued before `b`. Reflexive (`compare(x, x) == Equal`) and
/// antisymmetric (`compare(a, b) == compare(b, a).reverse()`), but **not**
/// transitive across the skip-count override; see the module doc comment.
pub fn compare_priority(a: &TaskEntry, b: &TaskEntry) -> Ordering {
    let skip_diff = a.skip_count as i64 - b.skip_count as i64;
    if skip_diff.abs() > SKIP_COUNT_OVERRIDE_THRESHOLD {
        return if skip_diff > 0 { Ordering::Less } else { Ordering::Greater };
    }
    if a.priority.value() != b.priority.value() {
        return b.priority.value().cmp(&a.priority.value());
    }
    a.enqueued_at_ms.cmp(&b.enqueued_at_ms)
}

struct Inner {
    entries: Vec<TaskEntry>,
    system_virtual_time: f64,
    last_finish_by_class: HashMap<u8, f64>,
}

/// The priority task queue (component C6).
pub struct PriorityScheduler {
    inner: Mutex<Inner>,
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityScheduler {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                system_virtual_time: 0.0,
                last_finish_by_class: HashMap::new(),
            }),
        }
    }

    /// Enqueue a new task, assigning it an id and computing its virtual
    /// start/finish times.
    pub fn enqueue(&self, meta: TaskMeta) -> TaskEntry {
        let mut inner = self.inner.lock();
        let now = now_ms();
        let class = meta.priority.value();
        let cost_rounds = meta.cost_rounds.clamp(1, 50);
        let last_finish = inner.last_finish_by_class.get(&class).copied().unwrap_or(0.0);
        let virtual_start_time = inner.system_virtual_time.max(last_finish);
        let virtual_finish_time = virtual_start_time + cost_rounds as f64 / meta.priority.weight();

        let entry = TaskEntry {
            id: Uuid::new_v4().to_string(),
            tool_name: meta.tool_name,
            priority: meta.priority,
            cost_rounds,
            cost_wall_ms: meta.cost_wall_ms,
            soft_deadline_ms: meta.soft_deadline_ms,
            enqueued_at_ms: now,
            source: meta.source,
            provider: meta.provider,
            model: meta.model,
            virtual_start_time,
            virtual_finish_time,
            skip_count: 0,
            last_considered_ms: now,
        };

        inner.last_finish_by_class.insert(class, virtual_finish_time);
        inner.system_virtual_time = inner.system_virtual_time.max(virtual_finish_time);
        inner.entries.push(entry.clone());
        entry
    }

    fn best_index(entries: &[TaskEntry]) -> Option<usize> {
        entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| compare_priority(a, b))
            .map(|(i, _)| i)
    }

    /// Remove and return the highest-priority entry per [`compare_priority`].
    pub fn dequeue(&self) -> Option<TaskEntry> {
        let mut inner = self.inner.lock();
        let idx = Self::best_index(&inner.entries)?;
        Some(inner.entries.remove(idx))
    }

    /// Return a clone of the entry [`dequeue`] would pop, without removing it.
    pub fn peek(&self) -> Option<TaskEntry> {
        let inner = self.inner.lock();
        let idx = Self::best_index(&inner.entries)?;
        inner.entries.get(idx).cloned()
    }

    /// Remove a specific entry by id, wherever it sits in the queue.
    pub fn remove(&self, id: &str) -> Option<TaskEntry> {
        let mut inner = self.inner.lock();
        let pos = inner.entries.iter().position(|e| e.id == id)?;
        Some(inner.entries.remove(pos))
    }

    /// All entries currently in a given priority class, in queue order.
    pub fn get_by_priority(&self, class: Priority) -> Vec<TaskEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.priority.value() == class.value())
            .cloned()
            .collect()
    }

    /// Re-insert a previously-dequeued entry, preserving its id, original
    /// `enqueued_at_ms`, and skip-count. Used by the scheduler core's
    /// work-stealing path, where a popped entry is passed over in favor of
    /// a lower-wait one and must go back in with `skip_count + 1`.
    pub fn requeue(&self, entry: TaskEntry) {
        self.inner.lock().entries.push(entry);
    }

    /// Increment an entry's skip-count, used by the scheduler core when it
    /// passes over this entry in favor of a lower-wait one (work-stealing).
    pub fn increment_skip_count(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.entries.iter_mut().find(|e| e.id == id) {
            e.skip_count += 1;
            e.last_considered_ms = now_ms();
            true
        } else {
            false
        }
    }

    /// Snapshot of queue depth per priority class.
    pub fn get_stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut by_priority = HashMap::new();
        for class in [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Background,
        ] {
            let count = inner.entries.iter().filter(|e| e.priority.value() == class.value()).count();
            by_priority.insert(format!("{:?}", class), count);
        }
        QueueStats {
            total: inner.entries.len(),
            by_priority,
        }
    }

    /// Promote any entry whose wait exceeds its class's starvation
    /// threshold one class upward, resetting its skip-count. Returns the
    /// number promoted. Idempotent within one invocation: each entry is
    /// considered exactly once per call.
    pub fn promote_starving_tasks(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = now_ms();
        let mut promoted = 0usize;
        for entry in inner.entries.iter_mut() {
            let Some(threshold) = entry.priority.starvation_threshold_ms() else {
                continue;
            };
            let waited = now.saturating_sub(entry.enqueued_at_ms);
            if waited >= threshold {
                if let Some(next) = entry.priority.promoted() {
                    entry.priority = next;
                    entry.skip_count = 0;
                    entry.last_considered_ms = now;
                    promoted += 1;
                }
            }
        }
        promoted
    }

    /// Number of entries currently queued.
    pub fn length(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }
}

/// Coarse classification of a tool invocation, used by [`estimate_cost_rounds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A read-only lookup.
    Read,
    /// A bash/edit/write mutation.
    Mutation,
    /// A single sub-agent run.
    SubagentSingle,
    /// Several sub-agents run in parallel.
    SubagentParallel,
    /// A full agent-team run.
    AgentTeam,
    /// Did not match a known pattern.
    Unknown,
}

/// Map a tool name to a coarse [`TaskKind`].
pub fn infer_task_kind(tool_name: &str) -> TaskKind {
    let lower = tool_name.to_ascii_lowercase();
    if lower.contains("read") || lower.contains("glob") || lower.contains("grep") {
        TaskKind::Read
    } else if lower.contains("bash") || lower.contains("edit") || lower.contains("write") {
        TaskKind::Mutation
    } else if lower.contains("subagent_parallel") {
        TaskKind::SubagentParallel
    } else if lower.contains("subagent") {
        TaskKind::SubagentSingle
    } else if lower.contains("agent_team") {
        TaskKind::AgentTeam
    } else {
        TaskKind::Unknown
    }
}

/// Context used to estimate a task's cost in scheduling rounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostContext {
    /// Number of sub-agents involved, for parallel/team kinds.
    pub agent_count: u32,
    /// Whether this is a retry of a prior attempt.
    pub is_retry: bool,
    /// Extra rounds added when the tool doesn't match any known framework.
    pub unknown_framework_bonus: u32,
}

/// Estimate a task's cost in scheduling rounds, clamped to `[1, 50]`.
pub fn estimate_cost_rounds(kind: TaskKind, ctx: &CostContext) -> u32 {
    let agents = ctx.agent_count.max(1);
    let base = match kind {
        TaskKind::Read => 1,
        TaskKind::Mutation => 2,
        TaskKind::SubagentSingle => 3,
        TaskKind::SubagentParallel => 3 * agents,
        TaskKind::AgentTeam => 5 * agents,
        TaskKind::Unknown => 1 + ctx.unknown_framework_bonus,
    };
    let mut cost = base;
    if ctx.is_retry {
        cost += 2;
    }
    cost.clamp(1, 50)
}

/// Context used to infer a task's priority class.
#[derive(Debug, Clone, Copy, Default)]
pub struct InferContext {
    /// Enqueued in direct response to interactive user input.
    pub is_interactive: bool,
    /// Enqueued by a background process.
    pub is_background: bool,
    /// Re-enqueued after a prior failed attempt.
    pub is_retry: bool,
}

/// `critical` for `question`-like tools, `high` when interactive,
/// `background` when backgrounded, `low` on retry, else a type-default.
pub fn infer_priority(tool_name: &str, ctx: &InferContext) -> Priority {
    let lower = tool_name.to_ascii_lowercase();
    if lower.contains("question") {
        return Priority::Critical;
    }
    if ctx.is_interactive {
        return Priority::High;
    }
    if ctx.is_background {
        return Priority::Background;
    }
    if ctx.is_retry {
        return Priority::Low;
    }
    match infer_task_kind(&lower) {
        TaskKind::AgentTeam | TaskKind::SubagentParallel => Priority::Normal,
        TaskKind::SubagentSingle => Priority::Normal,
        TaskKind::Mutation => Priority::Normal,
        TaskKind::Read => Priority::Normal,
        TaskKind::Unknown => Priority::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(priority: Priority) -> TaskMeta {
        TaskMeta {
            tool_name: "bash".to_string(),
            priority,
            cost_rounds: 2,
            cost_wall_ms: 100,
            soft_deadline_ms: None,
            source: None,
            provider: "acme".to_string(),
            model: "small".to_string(),
        }
    }

    #[test]
    fn comparator_is_reflexive() {
        let q = PriorityScheduler::new();
        let e = q.enqueue(meta(Priority::Normal));
        assert_eq!(compare_priority(&e, &e), Ordering::Equal);
    }

    #[test]
    fn comparator_is_antisymmetric() {
        let q = PriorityScheduler::new();
        let a = q.enqueue(meta(Priority::Low));
        let b = q.enqueue(meta(Priority::Critical));
        assert_eq!(compare_priority(&a, &b), compare_priority(&b, &a).reverse());
    }

    #[test]
    fn priority_order_dequeues_highest_class_first() {
        let q = PriorityScheduler::new();
        q.enqueue(meta(Priority::Low));
        q.enqueue(meta(Priority::Critical));
        q.enqueue(meta(Priority::Normal));

        let first = q.dequeue().unwrap();
        let second = q.dequeue().unwrap();
        let third = q.dequeue().unwrap();
        assert_eq!(first.priority, Priority::Critical);
        assert_eq!(second.priority, Priority::Normal);
        assert_eq!(third.priority, Priority::Low);
    }

    #[test]
    fn fifo_within_same_class() {
        let q = PriorityScheduler::new();
        let a = q.enqueue(meta(Priority::Normal));
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = q.enqueue(meta(Priority::Normal));
        let first = q.dequeue().unwrap();
        assert_eq!(first.id, a.id);
        let second = q.dequeue().unwrap();
        assert_eq!(second.id, b.id);
    }

    #[test]
    fn skip_count_gap_overrides_priority() {
        let q = PriorityScheduler::new();
        let low = q.enqueue(meta(Priority::Low));
        let _critical = q.enqueue(meta(Priority::Critical));
        for _ in 0..4 {
            q.increment_skip_count(&low.id);
        }
        let first = q.dequeue().unwrap();
        assert_eq!(first.id, low.id);
    }

    #[test]
    fn starvation_promotion_raises_long_waiting_low_task() {
        let q = PriorityScheduler::new();
        let entry = q.enqueue(meta(Priority::Low));
        {
            let mut inner = q.inner.lock();
            let e = inner.entries.iter_mut().find(|e| e.id == entry.id).unwrap();
            e.enqueued_at_ms = now_ms() - 120_000;
        }
        let promoted = q.promote_starving_tasks();
        assert_eq!(promoted, 1);
        let requeued = q.remove(&entry.id).unwrap();
        assert_ne!(requeued.priority, Priority::Low);
    }

    #[test]
    fn promote_starving_tasks_is_idempotent_within_one_call() {
        let q = PriorityScheduler::new();
        let entry = q.enqueue(meta(Priority::Background));
        {
            let mut inner = q.inner.lock();
            let e = inner.entries.iter_mut().find(|e| e.id == entry.id).unwrap();
            e.enqueued_at_ms = now_ms() - 200_000;
        }
        let promoted = q.promote_starving_tasks();
        assert_eq!(promoted, 1); // exactly one promotion per entry per call
    }

    #[test]
    fn cost_estimate_scales_with_agent_count() {
        let ctx = CostContext { agent_count: 3, is_retry: false, unknown_framework_bonus: 0 };
        assert_eq!(estimate_cost_rounds(TaskKind::SubagentParallel, &ctx), 9);
        assert_eq!(estimate_cost_rounds(TaskKind::AgentTeam, &ctx), 15);
    }

    #[test]
    fn infer_priority_question_is_always_critical() {
        let ctx = InferContext::default();
        assert_eq!(infer_priority("question_tool", &ctx), Priority::Critical);
    }

    #[test]
    fn infer_priority_retry_is_low_unless_interactive() {
        let ctx = InferContext { is_retry: true, ..Default::default() };
        assert_eq!(infer_priority("bash", &ctx), Priority::Low);
    }
}
