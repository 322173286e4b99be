//! Metric configuration
//!
//! Each metric names the matcher (or predicate, for durations) that drives
//! it, a bucket size, optional condition and slicing, an optional upload
//! threshold, and optional activation windows.

use serde::{Deserialize, Serialize};

/// Default bucket size: one hour
pub const DEFAULT_BUCKET_SIZE_NS: i64 = 3_600 * 1_000_000_000;

/// One metric definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub id: i64,

    #[serde(flatten)]
    pub kind: MetricKind,

    /// Aggregation window length in elapsed-realtime nanoseconds
    #[serde(default = "default_bucket_size_ns")]
    pub bucket_size_ns: i64,

    /// Predicate id gating aggregation
    pub condition: Option<i64>,

    /// Event-field projection slicing the aggregate
    #[serde(default)]
    pub dimensions: Vec<DimensionPosition>,

    /// State atom ids joined into the dimension key at event time
    #[serde(default)]
    pub state_atoms: Vec<i32>,

    /// Only dimensions whose full-bucket aggregate satisfies the threshold
    /// are reported
    pub threshold: Option<UploadThreshold>,

    /// Activation windows; a metric with none is always active
    #[serde(default)]
    pub activations: Vec<ActivationConfig>,
}

fn default_bucket_size_ns() -> i64 {
    DEFAULT_BUCKET_SIZE_NS
}

/// The metric family and its family-specific knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Count matched events per dimension per bucket
    Count {
        /// Matcher id
        what: i64,
    },

    /// Accumulate the true-span of a predicate
    Duration {
        /// Simple predicate id whose true-span is measured
        what: i64,
        #[serde(default)]
        aggregation: DurationAggregation,
    },

    /// Aggregate a numeric field of matched events
    Value {
        /// Matcher id
        what: i64,
        /// 1-based position of the numeric field
        value_field: usize,
        #[serde(default)]
        aggregation: ValueAggregation,
    },

    /// Sample field snapshots of matched events
    Gauge {
        /// Matcher id
        what: i64,
        #[serde(default)]
        sampling: GaugeSampling,
        /// Matcher id that triggers a sample, for trigger-based sampling
        trigger: Option<i64>,
        /// When set, samples come from the pull service on alarm ticks
        /// instead of pushed events
        #[serde(default)]
        pulled: bool,
    },

    /// Streaming quantile sketch over a numeric field
    Kll {
        /// Matcher id
        what: i64,
        /// 1-based position of the numeric field
        value_field: usize,
    },
}

impl MetricKind {
    /// Short family name for logs and reports
    pub fn family(&self) -> &'static str {
        match self {
            MetricKind::Count { .. } => "count",
            MetricKind::Duration { .. } => "duration",
            MetricKind::Value { .. } => "value",
            MetricKind::Gauge { .. } => "gauge",
            MetricKind::Kll { .. } => "kll",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    /// Every concurrent start contributes to the sum
    #[default]
    Sum,
    /// Each key reports only its longest single span
    Max,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueAggregation {
    #[default]
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeSampling {
    /// Every trigger event is sampled
    #[default]
    AllTriggerEvents,
    /// Sample when the linked condition turns true
    ConditionChangeToTrue,
    /// One uniformly random sample per bucket
    RandomOnePerBucket,
    /// The first N samples of each bucket
    FirstNSamples(u32),
}

/// One projected dimension field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionPosition {
    /// A fixed 1-based field position
    Field(usize),
    /// A uid drawn from the attribution chain
    AttributionUid(AttributionScope),
}

/// Which chain uids an `AttributionUid` dimension projects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionScope {
    First,
    Last,
    /// Expand into one dimension key per chain uid (Cartesian with the
    /// other positions)
    All,
}

/// Comparator gating which dimensions appear in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadThreshold {
    LtInt(i64),
    GtInt(i64),
    LteInt(i64),
    GteInt(i64),
}

impl UploadThreshold {
    /// Whether `value` satisfies the comparator
    pub fn passes(&self, value: i64) -> bool {
        match *self {
            UploadThreshold::LtInt(limit) => value < limit,
            UploadThreshold::GtInt(limit) => value > limit,
            UploadThreshold::LteInt(limit) => value <= limit,
            UploadThreshold::GteInt(limit) => value >= limit,
        }
    }
}

/// One activation window of a metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Matcher id whose match opens the window
    pub activation_matcher: i64,

    /// Window length in nanoseconds
    pub ttl_ns: i64,

    #[serde(default)]
    pub activation_type: ActivationType,

    /// Matcher id whose match closes the window early
    pub deactivation_matcher: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationType {
    #[default]
    ActivateImmediately,
    ActivateOnBoot,
}
