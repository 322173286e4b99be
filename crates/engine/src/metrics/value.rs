//! Value metric producer
//!
//! Aggregates a numeric field of matched events per dimension per bucket:
//! sum, min, max or average. Anomaly thresholds compare full-bucket sums,
//! rounded to integers.

use std::collections::HashMap;

use tally_config::ValueAggregation;
use tally_event::{Event, MetricDimensionKey};

use crate::anomaly::AnomalyTracker;
use crate::bucket::SkippedBucket;
use crate::report::{
    MetricReport, MetricReportData, SkippedBucketReport, ValueBucketReport, ValueReportEntry,
};

use super::MetricCommon;

#[derive(Debug, Clone, Copy, Default)]
struct ValueAccum {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
}

impl ValueAccum {
    fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    fn aggregate(&self, aggregation: ValueAggregation) -> f64 {
        match aggregation {
            ValueAggregation::Sum => self.sum,
            ValueAggregation::Min => self.min,
            ValueAggregation::Max => self.max,
            ValueAggregation::Avg => {
                if self.count == 0 {
                    0.0
                } else {
                    self.sum / self.count as f64
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub value: f64,
    pub sample_count: u64,
}

const BUCKET_FOOTPRINT: usize = std::mem::size_of::<ValueBucket>();

#[derive(Debug)]
pub struct ValueMetricProducer {
    pub common: MetricCommon,
    what_matcher: usize,
    value_field: usize,
    aggregation: ValueAggregation,

    current: HashMap<MetricDimensionKey, ValueAccum>,

    /// Full-bucket sums across partial buckets, for anomaly detection
    current_full: HashMap<MetricDimensionKey, i64>,

    past: HashMap<MetricDimensionKey, Vec<ValueBucket>>,
    skipped: Vec<SkippedBucket>,

    pub anomaly_trackers: Vec<AnomalyTracker>,
}

impl ValueMetricProducer {
    pub fn new(
        common: MetricCommon,
        what_matcher: usize,
        value_field: usize,
        aggregation: ValueAggregation,
    ) -> Self {
        Self {
            common,
            what_matcher,
            value_field,
            aggregation,
            current: HashMap::new(),
            current_full: HashMap::new(),
            past: HashMap::new(),
            skipped: Vec::new(),
            anomaly_trackers: Vec::new(),
        }
    }

    pub fn on_matched_event(&mut self, matcher_slot: usize, event: &Event) {
        if matcher_slot != self.what_matcher {
            return;
        }
        let ts = event.elapsed_timestamp_ns();
        self.flush_if_needed(ts);
        if !self.common.activations.is_active(ts) || !self.common.condition_met() {
            return;
        }
        let Some(value) = event.value_at(self.value_field).and_then(|v| v.as_f64()) else {
            tracing::debug!(
                metric = self.common.metric_id,
                position = self.value_field,
                "value field missing or non-numeric, event skipped"
            );
            return;
        };
        for key in self.common.metric_keys(event) {
            if !self.common.guardrail_allows(&self.current, &key) {
                continue;
            }
            self.current.entry(key).or_default().push(value);
        }
    }

    pub fn flush_if_needed(&mut self, now_ns: i64) {
        if self.common.bucket.is_crossed(now_ns) {
            self.flush_current_bucket(now_ns);
        }
    }

    pub fn flush_current_bucket(&mut self, now_ns: i64) {
        let (closed, skipped) = self.common.bucket.cut(now_ns);
        self.skipped.extend(skipped);

        if closed.end_ns > closed.start_ns {
            for (key, accum) in self.current.drain() {
                let value = accum.aggregate(self.aggregation);
                self.past.entry(key.clone()).or_default().push(ValueBucket {
                    start_ns: closed.start_ns,
                    end_ns: closed.end_ns,
                    value,
                    sample_count: accum.count,
                });
                *self.current_full.entry(key).or_insert(0) += value.round() as i64;
            }
        } else {
            self.current.clear();
        }

        if closed.closes_full_bucket {
            let ts = closed.end_ns;
            for (key, total) in self.current_full.drain() {
                for tracker in &mut self.anomaly_trackers {
                    tracker.detect_and_declare(ts, closed.bucket_num, &key, total);
                    tracker.add_past_bucket(&key, total, closed.bucket_num);
                }
            }
        }
    }

    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        include_partial: bool,
        erase: bool,
    ) -> MetricReport {
        if include_partial {
            self.flush_current_bucket(dump_time_ns);
        } else {
            self.flush_if_needed(dump_time_ns);
        }

        let mut entries = Vec::new();
        for (key, buckets) in &self.past {
            let reported: Vec<ValueBucketReport> = buckets
                .iter()
                .filter(|b| self.common.passes_threshold(b.value.round() as i64))
                .map(|b| ValueBucketReport {
                    start_ns: b.start_ns,
                    end_ns: b.end_ns,
                    value: b.value,
                    sample_count: b.sample_count,
                })
                .collect();
            if !reported.is_empty() {
                entries.push(ValueReportEntry {
                    dimension: key.clone(),
                    buckets: reported,
                });
            }
        }

        let report = MetricReport {
            metric_id: self.common.metric_id,
            family: "value".to_string(),
            dimension_guardrail_hit: self.common.dimension_guardrail_hit,
            skipped_buckets: self
                .skipped
                .iter()
                .map(|s| SkippedBucketReport {
                    start_ns: s.start_ns,
                    end_ns: s.end_ns,
                })
                .collect(),
            data: MetricReportData::Value { entries },
        };
        if erase {
            self.past.clear();
            self.skipped.clear();
            self.common.dimension_guardrail_hit = false;
        }
        report
    }

    pub fn drop_data(&mut self, drop_time_ns: i64) {
        self.current.clear();
        self.current_full.clear();
        self.past.clear();
        self.skipped.clear();
        tracing::debug!(metric = self.common.metric_id, drop_time_ns, "value data dropped");
    }

    pub fn clear_past_buckets(&mut self) {
        self.past.clear();
        self.skipped.clear();
    }

    pub fn byte_size(&self) -> usize {
        let past: usize = self
            .past
            .iter()
            .map(|(key, buckets)| key.byte_size() + buckets.len() * BUCKET_FOOTPRINT)
            .sum();
        let current: usize = self
            .current
            .keys()
            .map(|key| key.byte_size() + std::mem::size_of::<ValueAccum>())
            .sum();
        past + current + self.skipped.len() * std::mem::size_of::<SkippedBucket>()
    }
}
