//! Count metric producer
//!
//! One integer counter per dimension key per bucket. A matched event whose
//! condition is True increments; bucket crossings move the counters into
//! past buckets. Anomaly detection runs on the full-bucket sum, which
//! accumulates across partial buckets.

use std::collections::HashMap;

use tally_event::{Event, MetricDimensionKey};

use crate::anomaly::AnomalyTracker;
use crate::report::{CountBucketReport, CountReportEntry, MetricReport, MetricReportData};

use super::MetricCommon;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub count: i64,
}

const BUCKET_FOOTPRINT: usize = std::mem::size_of::<CountBucket>();

#[derive(Debug)]
pub struct CountMetricProducer {
    pub common: MetricCommon,
    what_matcher: usize,

    /// Counters of the current (possibly partial) bucket
    current: HashMap<MetricDimensionKey, i64>,

    /// Sum of previous partial buckets inside the current full bucket;
    /// feeds anomaly detection, not reports
    current_full: HashMap<MetricDimensionKey, i64>,

    past: HashMap<MetricDimensionKey, Vec<CountBucket>>,

    pub anomaly_trackers: Vec<AnomalyTracker>,
}

impl CountMetricProducer {
    pub fn new(common: MetricCommon, what_matcher: usize) -> Self {
        Self {
            common,
            what_matcher,
            current: HashMap::new(),
            current_full: HashMap::new(),
            past: HashMap::new(),
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
        for key in self.common.metric_keys(event) {
            if !self.common.guardrail_allows(&self.current, &key) {
                continue;
            }
            let count = self.current.entry(key.clone()).or_insert(0);
            *count += 1;
            let full_count = *self.current_full.get(&key).unwrap_or(&0) + *count;
            let bucket_num = self.common.bucket.current_bucket_num();
            for tracker in &mut self.anomaly_trackers {
                tracker.detect_and_declare(ts, bucket_num, &key, full_count);
            }
        }
    }

    pub fn flush_if_needed(&mut self, now_ns: i64) {
        if self.common.bucket.is_crossed(now_ns) {
            self.flush_current_bucket(now_ns);
        }
    }

    pub fn flush_current_bucket(&mut self, now_ns: i64) {
        let (closed, _skipped) = self.common.bucket.cut(now_ns);
        if closed.end_ns > closed.start_ns {
            for (key, count) in self.current.drain() {
                self.past.entry(key.clone()).or_default().push(CountBucket {
                    start_ns: closed.start_ns,
                    end_ns: closed.end_ns,
                    count,
                });
                *self.current_full.entry(key).or_insert(0) += count;
            }
        } else {
            self.current.clear();
        }
        if closed.closes_full_bucket {
            for (key, total) in self.current_full.drain() {
                for tracker in &mut self.anomaly_trackers {
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
            let reported: Vec<CountBucketReport> = buckets
                .iter()
                .filter(|b| self.common.passes_threshold(b.count))
                .map(|b| CountBucketReport {
                    start_ns: b.start_ns,
                    end_ns: b.end_ns,
                    count: b.count,
                })
                .collect();
            if !reported.is_empty() {
                entries.push(CountReportEntry {
                    dimension: key.clone(),
                    buckets: reported,
                });
            }
        }

        let report = MetricReport {
            metric_id: self.common.metric_id,
            family: "count".to_string(),
            dimension_guardrail_hit: self.common.dimension_guardrail_hit,
            skipped_buckets: Vec::new(),
            data: MetricReportData::Count { entries },
        };
        if erase {
            self.past.clear();
            self.common.dimension_guardrail_hit = false;
        }
        report
    }

    pub fn drop_data(&mut self, drop_time_ns: i64) {
        self.current.clear();
        self.current_full.clear();
        self.past.clear();
        tracing::debug!(metric = self.common.metric_id, drop_time_ns, "count data dropped");
    }

    pub fn clear_past_buckets(&mut self) {
        self.past.clear();
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
            .map(|key| key.byte_size() + std::mem::size_of::<i64>())
            .sum();
        past + current
    }
}
