//! Gauge metric producer
//!
//! Samples field snapshots of matched events. Sampling strategies: every
//! trigger event, on the condition turning true, one uniformly random
//! sample per bucket, or the first N samples per bucket. Pulled gauges
//! sample the pull service's events at pull-alarm ticks instead of pushed
//! events.

use std::collections::HashMap;

use rand::Rng;
use tally_config::GaugeSampling;
use tally_event::{Event, FieldValue, MetricDimensionKey};

use crate::bucket::SkippedBucket;
use crate::condition::ConditionState;
use crate::report::{
    GaugeBucketReport, GaugeReportEntry, GaugeSampleReport, MetricReport, MetricReportData,
    SkippedBucketReport,
};

use super::MetricCommon;

#[derive(Debug, Clone)]
pub struct GaugeSample {
    pub elapsed_ns: i64,
    pub fields: Vec<FieldValue>,
}

#[derive(Debug, Clone, Default)]
struct GaugeBucketAccum {
    samples: Vec<GaugeSample>,
    /// Events seen this bucket, for reservoir sampling
    seen: u64,
}

#[derive(Debug)]
pub struct GaugeMetricProducer {
    pub common: MetricCommon,
    what_matcher: usize,
    trigger_matcher: Option<usize>,
    sampling: GaugeSampling,
    /// Atom pulled at alarm ticks; `None` for pushed gauges
    pulled_atom: Option<i32>,

    current: HashMap<MetricDimensionKey, GaugeBucketAccum>,
    past: HashMap<MetricDimensionKey, Vec<(i64, i64, Vec<GaugeSample>)>>,
    skipped: Vec<SkippedBucket>,
}

impl GaugeMetricProducer {
    pub fn new(
        common: MetricCommon,
        what_matcher: usize,
        trigger_matcher: Option<usize>,
        sampling: GaugeSampling,
        pulled_atom: Option<i32>,
    ) -> Self {
        Self {
            common,
            what_matcher,
            trigger_matcher,
            sampling,
            pulled_atom,
            current: HashMap::new(),
            past: HashMap::new(),
            skipped: Vec::new(),
        }
    }

    pub fn pulled_atom_id(&self) -> Option<i32> {
        self.pulled_atom
    }

    pub fn on_matched_event(&mut self, matcher_slot: usize, event: &Event) {
        let ts = event.elapsed_timestamp_ns();
        self.flush_if_needed(ts);

        // Trigger matchers force a sample regardless of strategy.
        let is_trigger = Some(matcher_slot) == self.trigger_matcher;
        if matcher_slot != self.what_matcher && !is_trigger {
            return;
        }
        if self.pulled_atom.is_some() && !is_trigger {
            // Pulled gauges sample at alarm ticks, not on pushed events.
            return;
        }
        if !self.common.activations.is_active(ts) || !self.common.condition_met() {
            return;
        }
        self.sample(event, is_trigger);
    }

    pub fn on_condition_changed(&mut self, condition: ConditionState, _ts: i64) {
        self.common.condition = condition;
        // ConditionChangeToTrue sampling for pushed atoms picks up the
        // next matched event; for pulled atoms the next alarm tick while
        // the condition holds.
    }

    pub fn on_pulled_events(&mut self, ts_ns: i64, events: &[Event]) {
        self.flush_if_needed(ts_ns);
        if !self.common.activations.is_active(ts_ns) || !self.common.condition_met() {
            return;
        }
        for event in events {
            self.sample(event, false);
        }
    }

    fn sample(&mut self, event: &Event, forced: bool) {
        let ts = event.elapsed_timestamp_ns();
        for key in self.common.metric_keys(event) {
            if !self.common.guardrail_allows(&self.current, &key) {
                continue;
            }
            let accum = self.current.entry(key).or_default();
            accum.seen += 1;
            let sample = GaugeSample {
                elapsed_ns: ts,
                fields: event.values().to_vec(),
            };
            if forced {
                accum.samples.push(sample);
                continue;
            }
            match self.sampling {
                GaugeSampling::AllTriggerEvents | GaugeSampling::ConditionChangeToTrue => {
                    accum.samples.push(sample);
                }
                GaugeSampling::FirstNSamples(n) => {
                    if accum.samples.len() < n as usize {
                        accum.samples.push(sample);
                    }
                }
                GaugeSampling::RandomOnePerBucket => {
                    // Reservoir of size one.
                    if accum.samples.is_empty() {
                        accum.samples.push(sample);
                    } else if rand::rng().random_range(0..accum.seen) == 0 {
                        accum.samples[0] = sample;
                    }
                }
            }
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
                if accum.samples.is_empty() {
                    continue;
                }
                self.past.entry(key).or_default().push((
                    closed.start_ns,
                    closed.end_ns,
                    accum.samples,
                ));
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

        let entries: Vec<GaugeReportEntry> = self
            .past
            .iter()
            .map(|(key, buckets)| GaugeReportEntry {
                dimension: key.clone(),
                buckets: buckets
                    .iter()
                    .map(|(start_ns, end_ns, samples)| GaugeBucketReport {
                        start_ns: *start_ns,
                        end_ns: *end_ns,
                        samples: samples
                            .iter()
                            .map(|s| GaugeSampleReport {
                                elapsed_ns: s.elapsed_ns,
                                fields: s.fields.clone(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let report = MetricReport {
            metric_id: self.common.metric_id,
            family: "gauge".to_string(),
            dimension_guardrail_hit: self.common.dimension_guardrail_hit,
            skipped_buckets: self
                .skipped
                .iter()
                .map(|s| SkippedBucketReport {
                    start_ns: s.start_ns,
                    end_ns: s.end_ns,
                })
                .collect(),
            data: MetricReportData::Gauge { entries },
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
        self.past.clear();
        self.skipped.clear();
        tracing::debug!(metric = self.common.metric_id, drop_time_ns, "gauge data dropped");
    }

    pub fn clear_past_buckets(&mut self) {
        self.past.clear();
        self.skipped.clear();
    }

    pub fn byte_size(&self) -> usize {
        let sample_size = |samples: &[GaugeSample]| -> usize {
            samples
                .iter()
                .map(|s| {
                    16 + s
                        .fields
                        .iter()
                        .map(|f| match f {
                            FieldValue::Str(v) => 16 + v.len(),
                            FieldValue::Bytes(v) => 16 + v.len(),
                            _ => 16,
                        })
                        .sum::<usize>()
                })
                .sum()
        };
        let past: usize = self
            .past
            .iter()
            .map(|(key, buckets)| {
                key.byte_size()
                    + buckets
                        .iter()
                        .map(|(_, _, samples)| 16 + sample_size(samples))
                        .sum::<usize>()
            })
            .sum();
        let current: usize = self
            .current
            .iter()
            .map(|(key, accum)| key.byte_size() + sample_size(&accum.samples))
            .sum();
        past + current
    }
}
