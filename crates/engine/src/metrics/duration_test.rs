//! Duration producer tests

use std::sync::Arc;

use tally_config::{
    AlertConfig, ConfigKey, DimensionPosition, DurationAggregation, MetricConfig, MetricKind,
};
use tally_event::{Event, FieldValue};

use crate::activation::ActivationSet;
use crate::anomaly::AnomalyTracker;
use crate::condition::ConditionState;
use crate::metrics::{DurationMetricProducer, MetricCommon};
use crate::report::{DurationReportEntry, MetricReportData};
use crate::stats::EngineStats;

const START: usize = 0;
const STOP: usize = 1;
const STOP_ALL: usize = 2;
const BUCKET: i64 = 10_000;

fn producer(
    aggregation: DurationAggregation,
    nested: bool,
    with_condition: bool,
) -> DurationMetricProducer {
    let config = MetricConfig {
        id: 20,
        kind: MetricKind::Duration {
            what: 7,
            aggregation,
        },
        bucket_size_ns: BUCKET,
        condition: with_condition.then_some(5),
        dimensions: vec![DimensionPosition::Field(1)],
        state_atoms: Vec::new(),
        threshold: None,
        activations: Vec::new(),
    };
    let common = MetricCommon::new(
        &config,
        ConfigKey::new(1000, 1),
        0,
        0,
        with_condition.then_some(0),
        ActivationSet::new(&[], |_| None),
        Vec::new(),
        Arc::new(EngineStats::new()),
    );
    let mut producer = DurationMetricProducer::new(
        common,
        START,
        Some(STOP),
        Some(STOP_ALL),
        nested,
        aggregation,
    );
    if with_condition {
        producer.on_condition_changed(ConditionState::True, 0);
    }
    producer
}

fn start(ts: i64, dim: &str) -> Event {
    Event::new(100, ts).with_field(FieldValue::Str(dim.into()))
}

fn stop(ts: i64, dim: &str) -> Event {
    Event::new(101, ts).with_field(FieldValue::Str(dim.into()))
}

fn entries(producer: &mut DurationMetricProducer, dump_ns: i64) -> Vec<DurationReportEntry> {
    let report = producer.on_dump_report(dump_ns, true, false);
    match report.data {
        MetricReportData::Duration { entries } => entries,
        _ => panic!("expected duration data"),
    }
}

fn durations_for(entries: &[DurationReportEntry], dim: &str) -> Vec<i64> {
    entries
        .iter()
        .find(|e| e.dimension.what().values() == [FieldValue::Str(dim.into())])
        .map(|e| e.buckets.iter().map(|b| b.duration_ns).collect())
        .unwrap_or_default()
}

#[test]
fn test_simple_span() {
    let mut producer = producer(DurationAggregation::Sum, true, false);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(STOP, &stop(3_500, "a"));

    let entries = entries(&mut producer, 5_000);
    assert_eq!(durations_for(&entries, "a"), vec![2_500]);
}

#[test]
fn test_pause_resume_on_condition() {
    // Start at 1000, condition false at 1500, true at 2000, stop at 2500:
    // contributed duration is 500 + 500 = 1000.
    let mut producer = producer(DurationAggregation::Sum, true, true);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_condition_changed(ConditionState::False, 1_500);
    producer.on_condition_changed(ConditionState::True, 2_000);
    producer.on_matched_event(STOP, &stop(2_500, "a"));

    let entries = entries(&mut producer, 5_000);
    assert_eq!(durations_for(&entries, "a"), vec![1_000]);
}

#[test]
fn test_start_while_condition_false_accumulates_nothing() {
    let mut producer = producer(DurationAggregation::Sum, true, true);
    producer.on_condition_changed(ConditionState::False, 500);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(STOP, &stop(2_000, "a"));

    let entries = entries(&mut producer, 5_000);
    assert!(durations_for(&entries, "a").is_empty());
}

#[test]
fn test_nested_starts_need_matching_stops() {
    let mut producer = producer(DurationAggregation::Sum, true, false);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(START, &start(2_000, "a"));
    producer.on_matched_event(STOP, &stop(3_000, "a"));
    // Still running: one stop consumed one nesting level.
    producer.on_matched_event(STOP, &stop(4_000, "a"));

    let entries = entries(&mut producer, 5_000);
    assert_eq!(durations_for(&entries, "a"), vec![3_000]);
}

#[test]
fn test_unnested_collapses_starts() {
    let mut producer = producer(DurationAggregation::Sum, false, false);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(START, &start(2_000, "a"));
    producer.on_matched_event(STOP, &stop(3_000, "a"));

    let entries = entries(&mut producer, 5_000);
    assert_eq!(durations_for(&entries, "a"), vec![2_000]);
}

#[test]
fn test_stop_all_flushes_every_key() {
    let mut producer = producer(DurationAggregation::Sum, true, false);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(START, &start(2_000, "b"));
    producer.on_matched_event(STOP_ALL, &Event::new(102, 3_000));

    let entries = entries(&mut producer, 5_000);
    assert_eq!(durations_for(&entries, "a"), vec![2_000]);
    assert_eq!(durations_for(&entries, "b"), vec![1_000]);
}

#[test]
fn test_stop_all_at_start_time_is_zero() {
    let mut producer = producer(DurationAggregation::Sum, true, false);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(STOP_ALL, &Event::new(102, 1_000));

    let entries = entries(&mut producer, 5_000);
    // Zero-length spans contribute nothing.
    assert!(durations_for(&entries, "a").is_empty());
}

#[test]
fn test_sum_counts_concurrent_keys_independently() {
    let mut producer = producer(DurationAggregation::Sum, true, false);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(STOP, &stop(2_000, "a"));
    producer.on_matched_event(START, &start(2_500, "a"));
    producer.on_matched_event(STOP, &stop(3_000, "a"));

    let entries = entries(&mut producer, 5_000);
    // Sum aggregation adds the spans within the bucket.
    assert_eq!(durations_for(&entries, "a"), vec![1_500]);
}

#[test]
fn test_max_keeps_longest_span() {
    let mut producer = producer(DurationAggregation::Max, true, false);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(STOP, &stop(4_000, "a"));
    producer.on_matched_event(START, &start(4_500, "a"));
    producer.on_matched_event(STOP, &stop(5_000, "a"));

    let entries = entries(&mut producer, 6_000);
    assert_eq!(durations_for(&entries, "a"), vec![3_000]);
}

#[test]
fn test_span_rolls_across_bucket_boundary() {
    let mut producer = producer(DurationAggregation::Sum, true, false);
    producer.on_matched_event(START, &start(8_000, "a"));
    producer.on_matched_event(STOP, &stop(12_000, "a"));

    let entries = entries(&mut producer, 15_000);
    // 2000 in [0,10k), 2000 in [10k,20k).
    assert_eq!(durations_for(&entries, "a"), vec![2_000, 2_000]);
}

#[test]
fn test_partial_cut_preserves_running_span() {
    let mut producer = producer(DurationAggregation::Sum, true, false);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.flush_current_bucket(5_000);
    producer.on_matched_event(STOP, &stop(7_000, "a"));

    let entries = entries(&mut producer, 9_000);
    // 4000 in the partial [0,5000), 2000 in [5000,9000).
    assert_eq!(durations_for(&entries, "a"), vec![4_000, 2_000]);
}

#[test]
fn test_sliced_condition_pauses_matching_keys_only() {
    let mut producer = producer(DurationAggregation::Sum, true, true);
    producer.on_matched_event(START, &start(1_000, "a"));
    producer.on_matched_event(START, &start(1_000, "b"));

    let key_a = std::collections::HashSet::from([tally_event::DimensionKey::new(vec![
        FieldValue::Str("a".into()),
    ])]);
    let empty = std::collections::HashSet::new();
    producer.on_sliced_condition_may_change(ConditionState::True, &empty, &key_a, 2_000);

    producer.on_matched_event(STOP, &stop(3_000, "a"));
    producer.on_matched_event(STOP, &stop(3_000, "b"));

    let entries = entries(&mut producer, 5_000);
    // "a" was paused at 2000; "b" ran the whole time.
    assert_eq!(durations_for(&entries, "a"), vec![1_000]);
    assert_eq!(durations_for(&entries, "b"), vec![2_000]);
}

#[test]
fn test_duration_anomaly_alarm_schedule() {
    let mut producer = producer(DurationAggregation::Sum, true, false);
    let stats = Arc::new(EngineStats::new());
    producer.anomaly_trackers.push(AnomalyTracker::new(
        AlertConfig {
            id: 1,
            metric_id: 20,
            num_buckets: 1,
            trigger_if_sum_gt: 2_000,
            refractory_period_secs: 0,
        },
        ConfigKey::new(1000, 1),
        Arc::clone(&stats),
    ));

    producer.on_matched_event(START, &start(1_000, "a"));
    // Crossing predicted at start + threshold.
    let alarm = producer.anomaly_trackers[0].earliest_alarm_ns().unwrap();
    assert_eq!(alarm, 3_001);

    // Stopping before the predicted crossing cancels without declaring.
    producer.on_matched_event(STOP, &stop(2_000, "a"));
    assert!(producer.anomaly_trackers[0].earliest_alarm_ns().is_none());
    assert_eq!(stats.snapshot().anomalies_declared, 0);

    // A span that outlives the prediction declares when the alarm fires.
    producer.on_matched_event(START, &start(2_500, "a"));
    for tracker in &mut producer.anomaly_trackers {
        tracker.on_alarm_fired(6_000);
    }
    assert_eq!(stats.snapshot().anomalies_declared, 1);
}
