//! Aggregate runtime configuration, assembled from defaults, JSON/TOML
//! files, and environment overrides.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduling::{Jitter, PenaltyConfig, RateLimitOverride, RetryConfig, SchedulerCoreConfig};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The config file's contents failed to parse.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serializable mirror of [`RetryConfig`] (the runtime type isn't itself
/// `Deserialize` because [`Jitter`] carries no data payload worth exposing
/// beyond its three variants, which this mirrors directly).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySettings {
    /// See [`RetryConfig::max_retries`].
    pub max_retries: u32,
    /// See [`RetryConfig::initial_delay_ms`].
    pub initial_delay_ms: u64,
    /// See [`RetryConfig::max_delay_ms`].
    pub max_delay_ms: u64,
    /// See [`RetryConfig::multiplier`].
    pub multiplier: f64,
    /// One of `"none"`, `"partial"`, `"full"`; invalid values default to
    /// `"full"`.
    pub jitter: String,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            max_retries: d.max_retries,
            initial_delay_ms: d.initial_delay_ms,
            max_delay_ms: d.max_delay_ms,
            multiplier: d.multiplier,
            jitter: "full".to_string(),
        }
    }
}

impl RetrySettings {
    /// Convert to the runtime [`RetryConfig`], clamping invalid values.
    pub fn to_retry_config(&self) -> RetryConfig {
        let jitter = match self.jitter.to_ascii_lowercase().as_str() {
            "none" => Jitter::None,
            "partial" => Jitter::Partial,
            _ => Jitter::Full,
        };
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            multiplier: self.multiplier,
            jitter,
        }
        .normalized()
    }
}

/// Per-(provider, model) rate-limit override, serializable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Requests per minute.
    pub rpm: f64,
    /// Burst headroom multiplier.
    pub burst_multiplier: f64,
    /// Minimum spacing between dispatches, ms.
    pub min_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let d = RateLimitOverride::default();
        Self {
            rpm: d.rpm,
            burst_multiplier: d.burst_multiplier,
            min_interval_ms: d.min_interval_ms,
        }
    }
}

impl RateLimitSettings {
    /// Convert to the runtime [`RateLimitOverride`].
    pub fn to_override(&self) -> RateLimitOverride {
        RateLimitOverride {
            rpm: self.rpm,
            burst_multiplier: self.burst_multiplier,
            min_interval_ms: self.min_interval_ms,
        }
    }
}

/// Adaptive-penalty knobs, serializable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PenaltySettings {
    /// See [`PenaltyConfig::is_stable`].
    pub is_stable: bool,
    /// See [`PenaltyConfig::max_penalty`].
    pub max_penalty: u32,
    /// See [`PenaltyConfig::decay_ms`].
    pub decay_ms: u64,
}

impl Default for PenaltySettings {
    fn default() -> Self {
        let d = PenaltyConfig::default();
        Self { is_stable: d.is_stable, max_penalty: d.max_penalty, decay_ms: d.decay_ms }
    }
}

impl PenaltySettings {
    /// Convert to the runtime [`PenaltyConfig`].
    pub fn to_penalty_config(&self) -> PenaltyConfig {
        PenaltyConfig { is_stable: self.is_stable, max_penalty: self.max_penalty, decay_ms: self.decay_ms }
    }
}

/// Aggregate, file/env-loadable configuration for the whole runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrency ceiling before adaptive reduction.
    pub base_parallelism: u32,
    /// Starvation-promoter sweep cadence, ms.
    pub promote_interval_ms: u64,
    /// Default retry policy.
    pub retry: RetrySettings,
    /// Default per-(provider, model) rate-limit policy.
    pub rate_limit: RateLimitSettings,
    /// Adaptive penalty policy.
    pub penalty: PenaltySettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let core_defaults = SchedulerCoreConfig::default();
        Self {
            base_parallelism: core_defaults.base_parallelism,
            promote_interval_ms: core_defaults.promote_interval_ms,
            retry: RetrySettings::default(),
            rate_limit: RateLimitSettings::default(),
            penalty: PenaltySettings::default(),
        }
    }
}

impl SchedulerConfig {
    /// Build from the process environment. Recognized variables:
    /// `PI_SCHED_BASE_PARALLELISM`, `PI_SCHED_PROMOTE_INTERVAL_MS`,
    /// `PI_RATE_RPM`, `PI_RATE_BURST_MULTIPLIER`, `PI_RATE_MIN_INTERVAL_MS`,
    /// `PI_PENALTY_MAX`, `PI_PENALTY_DECAY_MS`, `PI_PENALTY_STABLE`. Invalid
    /// values are ignored, leaving the corresponding field at its default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = parse_env_u32("PI_SCHED_BASE_PARALLELISM") {
            cfg.base_parallelism = v;
        }
        if let Some(v) = parse_env_u64("PI_SCHED_PROMOTE_INTERVAL_MS") {
            cfg.promote_interval_ms = v;
        }
        if let Some(v) = parse_env_f64("PI_RATE_RPM") {
            cfg.rate_limit.rpm = v;
        }
        if let Some(v) = parse_env_f64("PI_RATE_BURST_MULTIPLIER") {
            cfg.rate_limit.burst_multiplier = v;
        }
        if let Some(v) = parse_env_u64("PI_RATE_MIN_INTERVAL_MS") {
            cfg.rate_limit.min_interval_ms = v;
        }
        if let Some(v) = parse_env_u32("PI_PENALTY_MAX") {
            cfg.penalty.max_penalty = v;
        }
        if let Some(v) = parse_env_u64("PI_PENALTY_DECAY_MS") {
            cfg.penalty.decay_ms = v;
        }
        if let Ok(v) = std::env::var("PI_PENALTY_STABLE") {
            cfg.penalty.is_stable = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        cfg
    }

    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist as JSON.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// The [`SchedulerCoreConfig`] this aggregate configures.
    pub fn core_config(&self) -> SchedulerCoreConfig {
        SchedulerCoreConfig {
            base_parallelism: self.base_parallelism,
            promote_interval_ms: self.promote_interval_ms,
            retry: self.retry.to_retry_config(),
        }
    }
}

fn parse_env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|s| s.parse::<u32>().ok()).filter(|v| *v > 0)
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).filter(|v| *v > 0)
}

fn parse_env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|s| s.parse::<f64>().ok()).filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_json() {
        let cfg = SchedulerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.base_parallelism, cfg.base_parallelism);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        std::env::set_var("PI_SCHED_BASE_PARALLELISM", "not-a-number");
        let cfg = SchedulerConfig::from_env();
        assert_eq!(cfg.base_parallelism, SchedulerConfig::default().base_parallelism);
        std::env::remove_var("PI_SCHED_BASE_PARALLELISM");
    }

    #[test]
    fn file_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("agentsched-config-test-{}.json", std::process::id()));
        let cfg = SchedulerConfig::default();
        cfg.to_file(&path).unwrap();
        let loaded = SchedulerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.base_parallelism, cfg.base_parallelism);
        let _ = fs::remove_file(&path);
    }
}
