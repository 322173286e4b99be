//! Duration metric producer
//!
//! Measures the true-span of a simple predicate. Two aggregations:
//! sum-over-keys (every concurrent start contributes) and max-per-key
//! (each key reports its longest single span per bucket).
//!
//! Each tracked key holds a started/paused/stopped state machine: a
//! condition edge to False pauses running spans, an edge back to True
//! resumes them, stopAll force-stops everything. Nested starts either
//! count (nesting enabled) or collapse to one.

use std::collections::{HashMap, HashSet};

use tally_config::DurationAggregation;
use tally_event::{DimensionKey, Event, MetricDimensionKey};

use crate::anomaly::AnomalyTracker;
use crate::condition::ConditionState;
use crate::report::{DurationBucketReport, DurationReportEntry, MetricReport, MetricReportData};

use super::MetricCommon;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DurationState {
    Started,
    Paused,
}

/// Live bookkeeping for one key
#[derive(Debug)]
struct DurationInfo {
    state: DurationState,
    start_count: i32,
    last_start_ns: i64,
    /// Duration accumulated in the current bucket before `last_start_ns`
    last_duration_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub duration_ns: i64,
}

const BUCKET_FOOTPRINT: usize = std::mem::size_of::<DurationBucket>();

#[derive(Debug)]
pub struct DurationMetricProducer {
    pub common: MetricCommon,
    start_matcher: usize,
    stop_matcher: Option<usize>,
    stop_all_matcher: Option<usize>,
    nested: bool,
    aggregation: DurationAggregation,

    /// Keys with a live (started or paused) span
    live: HashMap<MetricDimensionKey, DurationInfo>,

    /// Durations already closed in the current bucket
    closed_in_bucket: HashMap<MetricDimensionKey, i64>,

    /// Sum of previous partial buckets inside the current full bucket,
    /// for anomaly detection
    current_full: HashMap<MetricDimensionKey, i64>,

    past: HashMap<MetricDimensionKey, Vec<DurationBucket>>,

    pub anomaly_trackers: Vec<AnomalyTracker>,
}

impl DurationMetricProducer {
    pub fn new(
        common: MetricCommon,
        start_matcher: usize,
        stop_matcher: Option<usize>,
        stop_all_matcher: Option<usize>,
        nested: bool,
        aggregation: DurationAggregation,
    ) -> Self {
        Self {
            common,
            start_matcher,
            stop_matcher,
            stop_all_matcher,
            nested,
            aggregation,
            live: HashMap::new(),
            closed_in_bucket: HashMap::new(),
            current_full: HashMap::new(),
            past: HashMap::new(),
            anomaly_trackers: Vec::new(),
        }
    }

    pub fn on_matched_event(&mut self, matcher_slot: usize, event: &Event) {
        let ts = event.elapsed_timestamp_ns();
        self.flush_if_needed(ts);
        if matcher_slot == self.start_matcher {
            if !self.common.activations.is_active(ts) {
                return;
            }
            for key in self.common.metric_keys(event) {
                self.note_start(key, ts);
            }
        } else if Some(matcher_slot) == self.stop_matcher {
            for key in self.common.metric_keys(event) {
                self.note_stop(&key, ts, false);
            }
        } else if Some(matcher_slot) == self.stop_all_matcher {
            self.note_stop_all(ts);
        }
    }

    fn note_start(&mut self, key: MetricDimensionKey, ts: i64) {
        if !self.live.contains_key(&key) && !self.common.guardrail_allows(&self.live, &key) {
            return;
        }
        let condition_met = self.common.condition_met();
        let info = self.live.entry(key.clone()).or_insert(DurationInfo {
            state: DurationState::Paused,
            start_count: 0,
            last_start_ns: ts,
            last_duration_ns: 0,
        });
        if info.start_count == 0 {
            info.state = if condition_met {
                DurationState::Started
            } else {
                DurationState::Paused
            };
            info.last_start_ns = ts;
            info.start_count = 1;
        } else if self.nested {
            info.start_count += 1;
        }
        if info.state == DurationState::Started {
            self.start_anomaly_alarms(&key, ts);
        }
    }

    fn note_stop(&mut self, key: &MetricDimensionKey, ts: i64, stop_all: bool) {
        let Some(info) = self.live.get_mut(key) else {
            return;
        };
        if self.nested && !stop_all {
            info.start_count -= 1;
            if info.start_count > 0 {
                return;
            }
        }
        let mut total = info.last_duration_ns;
        if info.state == DurationState::Started {
            total += ts - info.last_start_ns;
        }
        self.live.remove(key);
        self.record_closed(key, total);
        self.stop_anomaly_alarms(key, ts);
    }

    fn note_stop_all(&mut self, ts: i64) {
        let keys: Vec<MetricDimensionKey> = self.live.keys().cloned().collect();
        for key in keys {
            self.note_stop(&key, ts, true);
        }
    }

    fn record_closed(&mut self, key: &MetricDimensionKey, duration_ns: i64) {
        let slot = self.closed_in_bucket.entry(key.clone()).or_insert(0);
        match self.aggregation {
            DurationAggregation::Sum => *slot += duration_ns,
            DurationAggregation::Max => *slot = (*slot).max(duration_ns),
        }
    }

    pub fn on_condition_changed(&mut self, condition: ConditionState, ts: i64) {
        self.common.condition = condition;
        if condition == ConditionState::True {
            self.resume_all(ts);
        } else {
            self.pause_all(ts);
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        overall: ConditionState,
        changed_to_true: &HashSet<DimensionKey>,
        changed_to_false: &HashSet<DimensionKey>,
        ts: i64,
    ) {
        self.common.condition = overall;
        if changed_to_true.is_empty() && changed_to_false.is_empty() {
            return;
        }
        for (key, info) in &mut self.live {
            if changed_to_false.contains(key.what()) && info.state == DurationState::Started {
                info.last_duration_ns += ts - info.last_start_ns;
                info.state = DurationState::Paused;
            } else if changed_to_true.contains(key.what()) && info.state == DurationState::Paused {
                info.state = DurationState::Started;
                info.last_start_ns = ts;
            }
        }
    }

    fn pause_all(&mut self, ts: i64) {
        for info in self.live.values_mut() {
            if info.state == DurationState::Started {
                info.last_duration_ns += ts - info.last_start_ns;
                info.state = DurationState::Paused;
            }
        }
        let keys: Vec<MetricDimensionKey> = self.live.keys().cloned().collect();
        for key in keys {
            self.stop_anomaly_alarms(&key, ts);
        }
    }

    fn resume_all(&mut self, ts: i64) {
        let mut resumed = Vec::new();
        for (key, info) in &mut self.live {
            if info.state == DurationState::Paused && info.start_count > 0 {
                info.state = DurationState::Started;
                info.last_start_ns = ts;
                resumed.push(key.clone());
            }
        }
        for key in resumed {
            self.start_anomaly_alarms(&key, ts);
        }
    }

    /// Running total for `key` in the current bucket as of `now_ns`
    fn running_total(&self, key: &MetricDimensionKey, now_ns: i64) -> i64 {
        let closed = *self.closed_in_bucket.get(key).unwrap_or(&0);
        let live = self.live.get(key).map_or(0, |info| {
            info.last_duration_ns
                + match info.state {
                    DurationState::Started => now_ns - info.last_start_ns,
                    DurationState::Paused => 0,
                }
        });
        match self.aggregation {
            DurationAggregation::Sum => closed + live,
            DurationAggregation::Max => closed.max(live),
        }
    }

    fn start_anomaly_alarms(&mut self, key: &MetricDimensionKey, now_ns: i64) {
        if self.anomaly_trackers.is_empty() {
            return;
        }
        let in_bucket = self.running_total(key, now_ns);
        let full_so_far = *self.current_full.get(key).unwrap_or(&0) + in_bucket;
        let bucket_num = self.common.bucket.current_bucket_num();
        for tracker in &mut self.anomaly_trackers {
            let so_far = tracker.past_sum(key, bucket_num) + full_so_far;
            let remaining = tracker.threshold() - so_far;
            if remaining < 0 {
                tracker.start_alarm(key, now_ns);
            } else {
                tracker.start_alarm(key, now_ns + remaining + 1);
            }
        }
    }

    fn stop_anomaly_alarms(&mut self, key: &MetricDimensionKey, now_ns: i64) {
        for tracker in &mut self.anomaly_trackers {
            tracker.stop_alarm(key, now_ns);
        }
    }

    pub fn flush_if_needed(&mut self, now_ns: i64) {
        if self.common.bucket.is_crossed(now_ns) {
            self.flush_current_bucket(now_ns);
        }
    }

    pub fn flush_current_bucket(&mut self, now_ns: i64) {
        let (closed, _skipped) = self.common.bucket.cut(now_ns);
        let bucket_end = closed.end_ns;

        // Roll running spans up to the boundary and restart them there.
        let mut totals: HashMap<MetricDimensionKey, i64> = self.closed_in_bucket.drain().collect();
        for (key, info) in &mut self.live {
            let mut contribution = info.last_duration_ns;
            if info.state == DurationState::Started {
                contribution += bucket_end - info.last_start_ns;
                info.last_start_ns = bucket_end;
            }
            info.last_duration_ns = 0;
            if contribution > 0 {
                let slot = totals.entry(key.clone()).or_insert(0);
                match self.aggregation {
                    DurationAggregation::Sum => *slot += contribution,
                    DurationAggregation::Max => *slot = (*slot).max(contribution),
                }
            }
        }

        if bucket_end > closed.start_ns {
            for (key, duration_ns) in &totals {
                if *duration_ns <= 0 {
                    continue;
                }
                self.past
                    .entry(key.clone())
                    .or_default()
                    .push(DurationBucket {
                        start_ns: closed.start_ns,
                        end_ns: bucket_end,
                        duration_ns: *duration_ns,
                    });
                *self.current_full.entry(key.clone()).or_insert(0) += *duration_ns;
            }
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
            let reported: Vec<DurationBucketReport> = buckets
                .iter()
                .filter(|b| self.common.passes_threshold(b.duration_ns))
                .map(|b| DurationBucketReport {
                    start_ns: b.start_ns,
                    end_ns: b.end_ns,
                    duration_ns: b.duration_ns,
                })
                .collect();
            if !reported.is_empty() {
                entries.push(DurationReportEntry {
                    dimension: key.clone(),
                    buckets: reported,
                });
            }
        }

        let report = MetricReport {
            metric_id: self.common.metric_id,
            family: "duration".to_string(),
            dimension_guardrail_hit: self.common.dimension_guardrail_hit,
            skipped_buckets: Vec::new(),
            data: MetricReportData::Duration { entries },
        };
        if erase {
            self.past.clear();
            self.common.dimension_guardrail_hit = false;
        }
        report
    }

    pub fn drop_data(&mut self, drop_time_ns: i64) {
        self.live.clear();
        self.closed_in_bucket.clear();
        self.current_full.clear();
        self.past.clear();
        for tracker in &mut self.anomaly_trackers {
            tracker.cancel_all_alarms();
        }
        tracing::debug!(
            metric = self.common.metric_id,
            drop_time_ns,
            "duration data dropped"
        );
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
        let live: usize = self
            .live
            .keys()
            .map(|key| key.byte_size() + std::mem::size_of::<DurationInfo>())
            .sum();
        past + live
    }
}
