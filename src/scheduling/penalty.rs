//! Adaptive penalty controller: reduces effective concurrency in response
//! to recent pressure signals (rate limits, timeouts, capacity errors), then
//! decays back to zero once the pressure subsides.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

const REASON_HISTORY_CAP: usize = 16;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Tunables for [`AdaptivePenaltyController`].
#[derive(Debug, Clone, Copy)]
pub struct PenaltyConfig {
    /// When `true`, the controller is a no-op: `get()` is always 0 and
    /// `apply_limit` is the identity function. Used for reproducible
    /// benchmarking.
    pub is_stable: bool,
    /// Ceiling on the penalty value.
    pub max_penalty: u32,
    /// Idle time after which an un-refreshed penalty decays to 0.
    pub decay_ms: u64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            is_stable: false,
            max_penalty: 10,
            decay_ms: 30_000,
        }
    }
}

struct Inner {
    penalty: u32,
    updated_at_ms: u64,
    reason_history: VecDeque<(String, u64)>,
}

/// Tracks pressure and derives an effective concurrency limit from it.
pub struct AdaptivePenaltyController {
    config: PenaltyConfig,
    inner: Mutex<Inner>,
}

impl AdaptivePenaltyController {
    /// Create a fresh controller with zero penalty.
    pub fn new(config: PenaltyConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                penalty: 0,
                updated_at_ms: now_ms(),
                reason_history: VecDeque::with_capacity(REASON_HISTORY_CAP),
            }),
        }
    }

    fn decay_if_idle(&self, inner: &mut Inner) {
        if self.config.is_stable {
            return;
        }
        let idle = now_ms().saturating_sub(inner.updated_at_ms);
        if inner.penalty > 0 && idle >= self.config.decay_ms {
            inner.penalty = 0;
        }
    }

    /// Increment the penalty (capped) and record `reason`.
    pub fn raise(&self, reason: &str) {
        if self.config.is_stable {
            return;
        }
        let mut inner = self.inner.lock();
        self.decay_if_idle(&mut inner);
        inner.penalty = (inner.penalty + 1).min(self.config.max_penalty);
        inner.updated_at_ms = now_ms();
        if inner.reason_history.len() == REASON_HISTORY_CAP {
            inner.reason_history.pop_front();
        }
        inner.reason_history.push_back((reason.to_string(), now_ms()));
    }

    /// Decrement the penalty, floored at 0.
    pub fn lower(&self) {
        if self.config.is_stable {
            return;
        }
        let mut inner = self.inner.lock();
        self.decay_if_idle(&mut inner);
        inner.penalty = inner.penalty.saturating_sub(1);
        inner.updated_at_ms = now_ms();
    }

    /// Current penalty value; always 0 in stable mode.
    pub fn get(&self) -> u32 {
        if self.config.is_stable {
            return 0;
        }
        let mut inner = self.inner.lock();
        self.decay_if_idle(&mut inner);
        inner.penalty
    }

    /// `max(1, floor(base_limit / (1 + penalty)))`; identity in stable mode.
    pub fn apply_limit(&self, base_limit: u32) -> u32 {
        if self.config.is_stable {
            return base_limit;
        }
        let penalty = self.get();
        (base_limit / (1 + penalty)).max(1)
    }

    /// Recent pressure reasons, oldest first.
    pub fn reason_history(&self) -> Vec<(String, u64)> {
        self.inner.lock().reason_history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_increments_and_caps_at_max_penalty() {
        let ctl = AdaptivePenaltyController::new(PenaltyConfig {
            is_stable: false,
            max_penalty: 3,
            decay_ms: 60_000,
        });
        for _ in 0..10 {
            ctl.raise("rate_limit");
        }
        assert_eq!(ctl.get(), 3);
    }

    #[test]
    fn lower_floors_at_zero() {
        let ctl = AdaptivePenaltyController::new(PenaltyConfig::default());
        ctl.lower();
        ctl.lower();
        assert_eq!(ctl.get(), 0);
    }

    #[test]
    fn apply_limit_reduces_proportionally_to_penalty() {
        let ctl = AdaptivePenaltyController::new(PenaltyConfig {
            is_stable: false,
            max_penalty: 10,
            decay_ms: 60_000,
        });
        ctl.raise("timeout"); // penalty = 1
        assert_eq!(ctl.apply_limit(10), 5);
        assert_eq!(ctl.apply_limit(1), 1);
    }

    #[test]
    fn stable_mode_is_always_identity() {
        let ctl = AdaptivePenaltyController::new(PenaltyConfig {
            is_stable: true,
            max_penalty: 10,
            decay_ms: 1,
        });
        ctl.raise("rate_limit");
        assert_eq!(ctl.get(), 0);
        assert_eq!(ctl.apply_limit(7), 7);
    }

    #[test]
    fn reason_history_is_bounded() {
        let ctl = AdaptivePenaltyController::new(PenaltyConfig::default());
        for i in 0..(REASON_HISTORY_CAP * 2) {
            ctl.raise(&format!("reason-{i}"));
        }
        assert_eq!(ctl.reason_history().len(), REASON_HISTORY_CAP);
    }
}
