//! Anomaly alert and periodic alarm configuration

use serde::{Deserialize, Serialize};

/// An anomaly alert over a metric's rolling bucket sum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub id: i64,

    /// The metric whose buckets feed the rolling sum
    pub metric_id: i64,

    /// How many buckets (including the current one) the rolling sum spans
    #[serde(default = "default_num_buckets")]
    pub num_buckets: u32,

    /// Declare an anomaly when the rolling sum exceeds this
    pub trigger_if_sum_gt: i64,

    /// Seconds after a declaration during which the same dimension stays
    /// quiet
    #[serde(default)]
    pub refractory_period_secs: u32,
}

fn default_num_buckets() -> u32 {
    1
}

/// A periodic wall-time alarm fanned out to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub id: i64,
    pub offset_millis: i64,
    pub period_millis: i64,
}
