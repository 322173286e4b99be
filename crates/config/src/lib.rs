//! Tally configuration
//!
//! Declarative configuration uploaded by operators: which events to match,
//! which predicates to track, which metrics to aggregate, and the alerts
//! and guardrails around them. Everything is serde-typed; payloads arrive
//! over IPC as JSON.
//!
//! Validation is a separate pass (`validate`) returning typed errors, so a
//! config can be parsed, inspected and rejected without touching the
//! engine.

mod alerts;
mod error;
mod key;
mod matchers;
mod metrics;
mod predicates;
mod states;
mod validation;

pub use alerts::{AlarmConfig, AlertConfig};
pub use error::{ConfigError, Result};
pub use key::ConfigKey;
pub use matchers::{
    FieldPredicate, LogicalOp, MatcherCombination, MatcherConfig, MatcherKind, PredicateOp,
    SimpleMatcher,
};
pub use metrics::{
    ActivationConfig, ActivationType, AttributionScope, DimensionPosition, DurationAggregation,
    GaugeSampling, MetricConfig, MetricKind, UploadThreshold, ValueAggregation,
    DEFAULT_BUCKET_SIZE_NS,
};
pub use predicates::{
    CombinationOp, InitialValue, PredicateCombination, PredicateConfig, PredicateKind,
    SimplePredicate,
};
pub use states::StateAtomConfig;
pub use validation::validate;

use serde::{Deserialize, Serialize};

/// A full configuration submission
///
/// All collections default to empty so minimal configs parse; guardrail
/// overrides are clamped by the engine, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Atom matchers, referenced by id
    pub matchers: Vec<MatcherConfig>,

    /// Condition predicates, referenced by id
    pub predicates: Vec<PredicateConfig>,

    /// Metric definitions
    pub metrics: Vec<MetricConfig>,

    /// Anomaly alerts over metric buckets
    pub alerts: Vec<AlertConfig>,

    /// Periodic alarms
    pub alarms: Vec<AlarmConfig>,

    /// State atoms metrics may slice by
    pub states: Vec<StateAtomConfig>,

    /// Config time-to-live; `None` means the config never expires
    pub ttl_ns: Option<i64>,

    /// Byte budget override; clamped to the engine maximum
    pub max_metrics_bytes: Option<usize>,

    /// Dump-request threshold override
    pub trigger_bytes: Option<usize>,

    /// Keep report history on disk across dumps
    pub persist_locally: bool,

    /// Package receiving restricted-metrics broadcasts; presence routes
    /// all data through the restricted SQL store
    pub restricted_metrics_delegate: Option<String>,

    /// Row TTL for restricted data, in days
    pub restricted_data_ttl_days: Option<u32>,
}

impl TallyConfig {
    /// Parse a JSON payload
    ///
    /// Parsing does not validate references; call [`validate`] before
    /// handing the config to the engine.
    pub fn from_json_str(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Serialize back to JSON (used by the config store)
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).expect("config serialization is infallible")
    }

    /// Ids of every metric in the config
    pub fn metric_ids(&self) -> Vec<i64> {
        self.metrics.iter().map(|m| m.id).collect()
    }

    /// Whether this config routes data through the restricted store
    pub fn is_restricted(&self) -> bool {
        self.restricted_metrics_delegate.is_some()
    }
}

// Test modules - only compiled during testing
#[cfg(test)]
mod config_test;
#[cfg(test)]
mod validation_test;
