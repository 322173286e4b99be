//! Value producer tests

use std::sync::Arc;

use tally_config::{ConfigKey, DimensionPosition, MetricConfig, MetricKind, ValueAggregation};
use tally_event::{Event, FieldValue};

use crate::activation::ActivationSet;
use crate::metrics::{MetricCommon, ValueMetricProducer};
use crate::report::{MetricReportData, ValueReportEntry};
use crate::stats::EngineStats;

const WHAT: usize = 0;
const BUCKET: i64 = 10_000;

fn producer(aggregation: ValueAggregation) -> ValueMetricProducer {
    let config = MetricConfig {
        id: 30,
        kind: MetricKind::Value {
            what: 1,
            value_field: 2,
            aggregation,
        },
        bucket_size_ns: BUCKET,
        condition: None,
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
        None,
        ActivationSet::new(&[], |_| None),
        Vec::new(),
        Arc::new(EngineStats::new()),
    );
    ValueMetricProducer::new(common, WHAT, 2, aggregation)
}

fn event(ts: i64, dim: &str, value: i64) -> Event {
    Event::new(100, ts)
        .with_field(FieldValue::Str(dim.into()))
        .with_field(FieldValue::Long(value))
}

fn entries(producer: &mut ValueMetricProducer, dump_ns: i64) -> Vec<ValueReportEntry> {
    let report = producer.on_dump_report(dump_ns, true, false);
    match report.data {
        MetricReportData::Value { entries } => entries,
        _ => panic!("expected value data"),
    }
}

fn values_for(entries: &[ValueReportEntry], dim: &str) -> Vec<f64> {
    entries
        .iter()
        .find(|e| e.dimension.what().values() == [FieldValue::Str(dim.into())])
        .map(|e| e.buckets.iter().map(|b| b.value).collect())
        .unwrap_or_default()
}

#[test]
fn test_sum_aggregation() {
    let mut producer = producer(ValueAggregation::Sum);
    producer.on_matched_event(WHAT, &event(1_000, "a", 5));
    producer.on_matched_event(WHAT, &event(2_000, "a", 7));
    producer.on_matched_event(WHAT, &event(3_000, "b", 1));

    let entries = entries(&mut producer, 5_000);
    assert_eq!(values_for(&entries, "a"), vec![12.0]);
    assert_eq!(values_for(&entries, "b"), vec![1.0]);
}

#[test]
fn test_min_max_avg() {
    for (aggregation, expected) in [
        (ValueAggregation::Min, 2.0),
        (ValueAggregation::Max, 8.0),
        (ValueAggregation::Avg, 5.0),
    ] {
        let mut producer = producer(aggregation);
        producer.on_matched_event(WHAT, &event(1_000, "a", 2));
        producer.on_matched_event(WHAT, &event(2_000, "a", 8));
        let entries = entries(&mut producer, 5_000);
        assert_eq!(values_for(&entries, "a"), vec![expected]);
    }
}

#[test]
fn test_float_fields_aggregate() {
    let mut producer = producer(ValueAggregation::Sum);
    let event = Event::new(100, 1_000)
        .with_field(FieldValue::Str("a".into()))
        .with_field(FieldValue::Float(1.5));
    producer.on_matched_event(WHAT, &event);

    let entries = entries(&mut producer, 5_000);
    assert_eq!(values_for(&entries, "a"), vec![1.5]);
}

#[test]
fn test_non_numeric_field_skipped() {
    let mut producer = producer(ValueAggregation::Sum);
    let event = Event::new(100, 1_000)
        .with_field(FieldValue::Str("a".into()))
        .with_field(FieldValue::Str("oops".into()));
    producer.on_matched_event(WHAT, &event);

    assert!(entries(&mut producer, 5_000).is_empty());
}

#[test]
fn test_skipped_buckets_reported() {
    let mut producer = producer(ValueAggregation::Sum);
    producer.on_matched_event(WHAT, &event(1_000, "a", 5));
    // The next event lands three buckets later.
    producer.on_matched_event(WHAT, &event(3 * BUCKET + 500, "a", 5));

    let report = producer.on_dump_report(4 * BUCKET, true, false);
    assert_eq!(report.skipped_buckets.len(), 2);
    assert_eq!(report.skipped_buckets[0].start_ns, BUCKET);
    assert_eq!(report.skipped_buckets[1].end_ns, 3 * BUCKET);
}

#[test]
fn test_sample_count_tracked() {
    let mut producer = producer(ValueAggregation::Avg);
    producer.on_matched_event(WHAT, &event(1_000, "a", 2));
    producer.on_matched_event(WHAT, &event(2_000, "a", 4));

    let entries = entries(&mut producer, 5_000);
    let entry = entries
        .iter()
        .find(|e| e.dimension.what().values() == [FieldValue::Str("a".into())])
        .unwrap();
    assert_eq!(entry.buckets[0].sample_count, 2);
}
