//! KLL quantile metric producer
//!
//! Streams a numeric field into a compact KLL sketch per dimension per
//! bucket. Sketches merge, which is how partial buckets of the same full
//! bucket collapse into one reported bucket at dump time.

use std::collections::HashMap;

use rand::Rng;
use tally_event::{Event, MetricDimensionKey};

use crate::bucket::SkippedBucket;
use crate::report::{
    KllBucketReport, KllReportEntry, MetricReport, MetricReportData, SkippedBucketReport,
};

use super::MetricCommon;

/// Ranks reported for every sketch
const REPORT_RANKS: [f64; 5] = [0.0, 0.5, 0.9, 0.99, 1.0];

/// Default compactor width
const DEFAULT_K: usize = 200;

/// A small KLL sketch: a stack of compactors, each half the weight of the
/// one above. When capacity overflows, the fullest low level sorts its
/// buffer and promotes a random half upward.
#[derive(Debug, Clone, Default)]
pub struct KllSketch {
    compactors: Vec<Vec<f64>>,
    k: usize,
    count: u64,
    min: f64,
    max: f64,
}

impl KllSketch {
    pub fn new() -> Self {
        Self::with_k(DEFAULT_K)
    }

    pub fn with_k(k: usize) -> Self {
        Self {
            compactors: vec![Vec::new()],
            k: k.max(8),
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, value: f64) {
        self.compactors[0].push(value);
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.compact_if_needed();
    }

    /// Merge another sketch into this one
    pub fn merge(&mut self, other: &KllSketch) {
        if other.is_empty() {
            return;
        }
        while self.compactors.len() < other.compactors.len() {
            self.compactors.push(Vec::new());
        }
        for (level, buffer) in other.compactors.iter().enumerate() {
            self.compactors[level].extend_from_slice(buffer);
        }
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.compact_if_needed();
    }

    fn capacity_at(&self, level: usize) -> usize {
        // Higher levels shrink geometrically but never below 8.
        let depth = self.compactors.len() - 1 - level;
        ((self.k as f64) * 0.7f64.powi(depth as i32)).ceil() as usize + 8
    }

    fn total_len(&self) -> usize {
        self.compactors.iter().map(|c| c.len()).sum()
    }

    fn total_capacity(&self) -> usize {
        (0..self.compactors.len()).map(|l| self.capacity_at(l)).sum()
    }

    fn compact_if_needed(&mut self) {
        while self.total_len() > self.total_capacity() {
            let level = (0..self.compactors.len())
                .find(|&l| self.compactors[l].len() >= self.capacity_at(l))
                .unwrap_or(0);
            self.compact_level(level);
        }
    }

    fn compact_level(&mut self, level: usize) {
        if self.compactors.len() <= level + 1 {
            self.compactors.push(Vec::new());
        }
        let mut buffer = std::mem::take(&mut self.compactors[level]);
        buffer.sort_by(|a, b| a.total_cmp(b));
        let offset = usize::from(rand::rng().random_bool(0.5));
        let promoted: Vec<f64> = buffer
            .iter()
            .skip(offset)
            .step_by(2)
            .copied()
            .collect();
        self.compactors[level + 1].extend(promoted);
    }

    /// Approximate value at `rank` in [0, 1]
    pub fn quantile(&self, rank: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        if rank <= 0.0 {
            return Some(self.min);
        }
        if rank >= 1.0 {
            return Some(self.max);
        }
        // Weighted flatten: items at level l carry weight 2^l.
        let mut weighted: Vec<(f64, u64)> = Vec::with_capacity(self.total_len());
        for (level, buffer) in self.compactors.iter().enumerate() {
            let weight = 1u64 << level;
            weighted.extend(buffer.iter().map(|&v| (v, weight)));
        }
        weighted.sort_by(|a, b| a.0.total_cmp(&b.0));
        let total: u64 = weighted.iter().map(|(_, w)| w).sum();
        let target = (rank * total as f64) as u64;
        let mut seen = 0;
        for (value, weight) in weighted {
            seen += weight;
            if seen > target {
                return Some(value);
            }
        }
        Some(self.max)
    }

    fn byte_size(&self) -> usize {
        self.total_len() * std::mem::size_of::<f64>() + 64
    }
}

#[derive(Debug)]
struct KllBucket {
    start_ns: i64,
    end_ns: i64,
    sketch: KllSketch,
}

#[derive(Debug)]
pub struct KllMetricProducer {
    pub common: MetricCommon,
    what_matcher: usize,
    value_field: usize,

    current: HashMap<MetricDimensionKey, KllSketch>,
    past: HashMap<MetricDimensionKey, Vec<KllBucket>>,
    skipped: Vec<SkippedBucket>,
}

impl KllMetricProducer {
    pub fn new(common: MetricCommon, what_matcher: usize, value_field: usize) -> Self {
        Self {
            common,
            what_matcher,
            value_field,
            current: HashMap::new(),
            past: HashMap::new(),
            skipped: Vec::new(),
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
            return;
        };
        for key in self.common.metric_keys(event) {
            if !self.common.guardrail_allows(&self.current, &key) {
                continue;
            }
            self.current.entry(key).or_insert_with(KllSketch::new).add(value);
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
            for (key, sketch) in self.current.drain() {
                if sketch.is_empty() {
                    continue;
                }
                self.past.entry(key).or_default().push(KllBucket {
                    start_ns: closed.start_ns,
                    end_ns: closed.end_ns,
                    sketch,
                });
            }
        } else {
            self.current.clear();
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

        let bucket_size = self.common.bucket.bucket_size_ns();
        let mut entries = Vec::new();
        for (key, buckets) in &self.past {
            // Partial buckets belonging to the same aligned bucket merge
            // into one reported bucket.
            let mut merged: Vec<KllBucketReport> = Vec::new();
            let mut pending: Option<(i64, i64, KllSketch)> = None;
            for bucket in buckets {
                let same_aligned = pending.as_ref().is_some_and(|(start, end, _)| {
                    bucket.start_ns == *end && bucket.end_ns - start <= bucket_size
                });
                if same_aligned {
                    let (_, end, sketch) = pending.as_mut().unwrap();
                    *end = bucket.end_ns;
                    sketch.merge(&bucket.sketch);
                } else {
                    if let Some(done) = pending.take() {
                        merged.push(Self::bucket_report(done));
                    }
                    pending = Some((bucket.start_ns, bucket.end_ns, bucket.sketch.clone()));
                }
            }
            if let Some(done) = pending.take() {
                merged.push(Self::bucket_report(done));
            }
            if !merged.is_empty() {
                entries.push(KllReportEntry {
                    dimension: key.clone(),
                    buckets: merged,
                });
            }
        }

        let report = MetricReport {
            metric_id: self.common.metric_id,
            family: "kll".to_string(),
            dimension_guardrail_hit: self.common.dimension_guardrail_hit,
            skipped_buckets: self
                .skipped
                .iter()
                .map(|s| SkippedBucketReport {
                    start_ns: s.start_ns,
                    end_ns: s.end_ns,
                })
                .collect(),
            data: MetricReportData::Kll { entries },
        };
        if erase {
            self.past.clear();
            self.skipped.clear();
            self.common.dimension_guardrail_hit = false;
        }
        report
    }

    fn bucket_report((start_ns, end_ns, sketch): (i64, i64, KllSketch)) -> KllBucketReport {
        KllBucketReport {
            start_ns,
            end_ns,
            count: sketch.count(),
            quantiles: REPORT_RANKS
                .iter()
                .filter_map(|&rank| sketch.quantile(rank).map(|v| (rank, v)))
                .collect(),
        }
    }

    pub fn drop_data(&mut self, drop_time_ns: i64) {
        self.current.clear();
        self.past.clear();
        self.skipped.clear();
        tracing::debug!(metric = self.common.metric_id, drop_time_ns, "kll data dropped");
    }

    pub fn clear_past_buckets(&mut self) {
        self.past.clear();
        self.skipped.clear();
    }

    pub fn byte_size(&self) -> usize {
        let past: usize = self
            .past
            .iter()
            .map(|(key, buckets)| {
                key.byte_size() + buckets.iter().map(|b| b.sketch.byte_size() + 16).sum::<usize>()
            })
            .sum();
        let current: usize = self
            .current
            .iter()
            .map(|(key, sketch)| key.byte_size() + sketch.byte_size())
            .sum();
        past + current
    }
}
