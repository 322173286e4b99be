//! Tally engine
//!
//! The event-processing core: a central processor owns one metrics
//! manager per uploaded configuration; each manager compiles its config
//! into atom matchers, tri-valued condition trackers and metric producers
//! (count, duration, value, gauge, KLL) that aggregate into aligned time
//! buckets. A flush engine enforces byte and rate guardrails and yields
//! compact reports through host broadcasts.
//!
//! # Concurrency
//!
//! The core is blocking and lock-ordered: the processor's metrics lock
//! guards all per-config state for the duration of each public operation;
//! a second lock guards only the next-anomaly-alarm slot and is never
//! held while taking the first. Host callbacks run under the metrics lock
//! and must not re-enter the processor.
//!
//! # Error policy
//!
//! Ingress errors become statistics (`EngineStats`) and are swallowed;
//! the event loop never aborts. Config, storage and query surfaces return
//! typed errors.

pub mod activation;
pub mod anomaly;
pub mod atoms;
pub mod bucket;
pub mod condition;
pub mod limits;
pub mod manager;
pub mod matcher;
pub mod metrics;
pub mod processor;
pub mod pull;
pub mod query;
pub mod report;
pub mod state;
pub mod stats;
pub mod trigger;
pub mod uid;

mod error;

pub use condition::ConditionState;
pub use error::{EngineError, Result};
pub use manager::MetricsManager;
pub use processor::{
    AllowAllPermissions, PermissionChecker, Processor, ProcessorCallbacks, ProcessorOptions,
};
pub use query::{InvalidQueryReason, QueryCallback};
pub use report::DumpReportReason;
pub use stats::{DataCorruptedReason, EngineStats, StatsSnapshot};

#[cfg(test)]
mod state_test;
