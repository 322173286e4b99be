//! Outbound report types
//!
//! The dump payload is one `ConfigMetricsReportList` per config key,
//! carrying the historical on-disk reports followed by the in-memory
//! snapshot. Everything is serde-typed; the wire bytes are one
//! length-prefixed frame (`encode_report_list`).

use serde::{Deserialize, Serialize};
use tally_event::{FieldValue, MetricDimensionKey};

use crate::stats::DataCorruptedReason;

/// Why a report was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpReportReason {
    DeviceShutdown,
    ConfigUpdated,
    ConfigRemoved,
    GetDataCalled,
    AdbDump,
    ConfigReset,
}

/// The full dump payload for one config key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetricsReportList {
    pub uid: i32,
    pub id: i64,
    /// Incremented on every erasing dump of this key
    pub report_number: i32,
    /// Identifies this engine incarnation across restarts
    pub engine_instance_id: i64,
    pub reports: Vec<ConfigMetricsReport>,
}

/// One report: the in-memory snapshot of a config at dump time, or a
/// historical snapshot recovered from disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigMetricsReport {
    pub metrics: Vec<MetricReport>,
    pub uid_snapshot: Option<UidSnapshot>,
    pub last_report_elapsed_ns: i64,
    pub current_report_elapsed_ns: i64,
    pub last_report_wall_ns: i64,
    pub current_report_wall_ns: i64,
    pub dump_reason: Option<DumpReportReason>,
    /// Interned strings referenced by dimension values
    pub strings: Vec<String>,
    pub data_corrupted_reasons: Vec<DataCorruptedReason>,
}

/// One metric's sub-report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricReport {
    pub metric_id: i64,
    pub family: String,
    pub dimension_guardrail_hit: bool,
    pub skipped_buckets: Vec<SkippedBucketReport>,
    pub data: MetricReportData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedBucketReport {
    pub start_ns: i64,
    pub end_ns: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricReportData {
    Count { entries: Vec<CountReportEntry> },
    Duration { entries: Vec<DurationReportEntry> },
    Value { entries: Vec<ValueReportEntry> },
    Gauge { entries: Vec<GaugeReportEntry> },
    Kll { entries: Vec<KllReportEntry> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountReportEntry {
    pub dimension: MetricDimensionKey,
    pub buckets: Vec<CountBucketReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountBucketReport {
    pub start_ns: i64,
    pub end_ns: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationReportEntry {
    pub dimension: MetricDimensionKey,
    pub buckets: Vec<DurationBucketReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBucketReport {
    pub start_ns: i64,
    pub end_ns: i64,
    pub duration_ns: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueReportEntry {
    pub dimension: MetricDimensionKey,
    pub buckets: Vec<ValueBucketReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueBucketReport {
    pub start_ns: i64,
    pub end_ns: i64,
    pub value: f64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaugeReportEntry {
    pub dimension: MetricDimensionKey,
    pub buckets: Vec<GaugeBucketReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaugeBucketReport {
    pub start_ns: i64,
    pub end_ns: i64,
    pub samples: Vec<GaugeSampleReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaugeSampleReport {
    pub elapsed_ns: i64,
    pub fields: Vec<FieldValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KllReportEntry {
    pub dimension: MetricDimensionKey,
    pub buckets: Vec<KllBucketReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KllBucketReport {
    pub start_ns: i64,
    pub end_ns: i64,
    pub count: u64,
    /// (rank, value) pairs at fixed ranks
    pub quantiles: Vec<(f64, f64)>,
}

/// Package snapshot attached when a report carries any metric data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UidSnapshot {
    pub snapshot_elapsed_ns: i64,
    pub entries: Vec<UidSnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidSnapshotEntry {
    pub uid: i32,
    pub package: String,
    pub version: i64,
}

/// Encode the dump payload as one length-prefixed frame
pub fn encode_report_list(list: &ConfigMetricsReportList) -> Vec<u8> {
    let payload = serde_json::to_vec(list).expect("report serialization is infallible");
    tally_storage::frame_bytes(&payload)
}

/// Collect the distinct strings appearing in reported dimensions, in
/// first-use order
pub fn collect_strings(report: &ConfigMetricsReport) -> Vec<String> {
    let mut strings: Vec<String> = Vec::new();
    let mut push = |key: &MetricDimensionKey| {
        for value in key.what().values().iter().chain(key.state().values()) {
            if let FieldValue::Str(s) = value
                && !strings.iter().any(|existing| existing == s)
            {
                strings.push(s.clone());
            }
        }
    };
    for metric in &report.metrics {
        match &metric.data {
            MetricReportData::Count { entries } => entries.iter().for_each(|e| push(&e.dimension)),
            MetricReportData::Duration { entries } => {
                entries.iter().for_each(|e| push(&e.dimension))
            }
            MetricReportData::Value { entries } => entries.iter().for_each(|e| push(&e.dimension)),
            MetricReportData::Gauge { entries } => entries.iter().for_each(|e| push(&e.dimension)),
            MetricReportData::Kll { entries } => entries.iter().for_each(|e| push(&e.dimension)),
        }
    }
    strings
}
