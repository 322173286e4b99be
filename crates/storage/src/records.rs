//! Persisted record shapes
//!
//! The engine owns these records; the byte layout is the frame codec's
//! concern. Timestamps in activation records are remaining TTLs, rebased
//! against the current clock on load.

use serde::{Deserialize, Serialize};

/// Per-train install bookkeeping, keyed by train name on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallTrainInfo {
    pub train_name: String,
    pub version_code: i64,
    pub requires_staging: bool,
    pub rollback_enabled: bool,
    pub requires_low_latency_monitor: bool,
    pub status: i32,
    pub experiment_ids: Vec<i64>,
}

/// Activation status of every config, written at shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConfigList {
    pub configs: Vec<ActiveConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConfig {
    pub uid: i32,
    pub id: i64,
    pub metrics: Vec<ActiveMetric>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMetric {
    pub metric_id: i64,
    pub activations: Vec<ActiveActivation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveActivation {
    pub state: ActiveActivationState,
    /// Nanoseconds of activation window left at save time
    pub remaining_ttl_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveActivationState {
    Active,
    ActiveOnBoot,
}

/// Cross-restart metadata for every config: anomaly refractory ends,
/// anchored to wall-clock seconds so they survive elapsed-clock resets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataList {
    pub entries: Vec<ConfigMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    pub uid: i32,
    pub id: i64,
    pub alerts: Vec<AlertMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMetadata {
    pub alert_id: i64,
    pub refractory_end_wall_sec: i64,
}
