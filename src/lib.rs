//! Core scheduling and flow-control runtime for agent-orchestration
//! workloads.
//!
//! This crate implements the subsystem that sits between a producer of
//! heterogeneous tasks (short calls, sub-agent runs, team runs) and a set
//! of rate-limited model providers: a starvation-resistant priority queue,
//! an adaptive concurrency pool, a per-provider/per-model token-bucket
//! limiter, a backoff-with-retry driver, a file-based lock protecting
//! shared on-disk state, and a metrics collector observing all of the
//! above.
//!
//! ## Architecture
//!
//! - `scheduling::lock`: storage lock with dead/stale-holder reclaim
//! - `scheduling::ratelimit`: per-(provider, model) token buckets
//! - `scheduling::retry`: error classification and backoff-with-jitter
//! - `scheduling::pool`: bounded-concurrency worker pool
//! - `scheduling::penalty`: adaptive concurrency reduction
//! - `scheduling::queue`: five-class priority queue
//! - `scheduling::core`: binds the above into the dispatch loop
//! - `scheduling::metrics`: rolling-window metrics and summaries
//! - `scheduling::cancel`: cancellation signal tree
//! - `config`: aggregate, file/env-loadable runtime configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod scheduling;

pub use config::SchedulerConfig;

/// Crate version, as set in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as set in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
