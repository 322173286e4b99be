//! Gauge producer tests

use std::sync::Arc;

use tally_config::{ConfigKey, DimensionPosition, GaugeSampling, MetricConfig, MetricKind};
use tally_event::{Event, FieldValue};

use crate::activation::ActivationSet;
use crate::metrics::{GaugeMetricProducer, MetricCommon};
use crate::report::{GaugeReportEntry, MetricReportData};
use crate::stats::EngineStats;

const WHAT: usize = 0;
const TRIGGER: usize = 1;
const BUCKET: i64 = 10_000;

fn producer(sampling: GaugeSampling, pulled_atom: Option<i32>) -> GaugeMetricProducer {
    let config = MetricConfig {
        id: 40,
        kind: MetricKind::Gauge {
            what: 1,
            sampling,
            trigger: Some(2),
            pulled: pulled_atom.is_some(),
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
    GaugeMetricProducer::new(common, WHAT, Some(TRIGGER), sampling, pulled_atom)
}

fn event(ts: i64, dim: &str, value: i64) -> Event {
    Event::new(100, ts)
        .with_field(FieldValue::Str(dim.into()))
        .with_field(FieldValue::Long(value))
}

fn entries(producer: &mut GaugeMetricProducer, dump_ns: i64) -> Vec<GaugeReportEntry> {
    let report = producer.on_dump_report(dump_ns, true, false);
    match report.data {
        MetricReportData::Gauge { entries } => entries,
        _ => panic!("expected gauge data"),
    }
}

fn sample_count(entries: &[GaugeReportEntry], dim: &str) -> usize {
    entries
        .iter()
        .find(|e| e.dimension.what().values() == [FieldValue::Str(dim.into())])
        .map(|e| e.buckets.iter().map(|b| b.samples.len()).sum())
        .unwrap_or(0)
}

#[test]
fn test_all_trigger_events_samples_everything() {
    let mut producer = producer(GaugeSampling::AllTriggerEvents, None);
    producer.on_matched_event(WHAT, &event(1_000, "a", 1));
    producer.on_matched_event(WHAT, &event(2_000, "a", 2));

    let entries = entries(&mut producer, 5_000);
    assert_eq!(sample_count(&entries, "a"), 2);
}

#[test]
fn test_first_n_caps_samples() {
    let mut producer = producer(GaugeSampling::FirstNSamples(2), None);
    for i in 0..5 {
        producer.on_matched_event(WHAT, &event(1_000 + i, "a", i));
    }
    let entries = entries(&mut producer, 5_000);
    assert_eq!(sample_count(&entries, "a"), 2);
}

#[test]
fn test_random_one_per_bucket_keeps_exactly_one() {
    let mut producer = producer(GaugeSampling::RandomOnePerBucket, None);
    for i in 0..20 {
        producer.on_matched_event(WHAT, &event(1_000 + i, "a", i));
    }
    let entries = entries(&mut producer, 5_000);
    assert_eq!(sample_count(&entries, "a"), 1);
}

#[test]
fn test_first_n_resets_per_bucket() {
    let mut producer = producer(GaugeSampling::FirstNSamples(1), None);
    producer.on_matched_event(WHAT, &event(1_000, "a", 1));
    producer.on_matched_event(WHAT, &event(2_000, "a", 2));
    producer.on_matched_event(WHAT, &event(BUCKET + 1_000, "a", 3));

    let entries = entries(&mut producer, 2 * BUCKET);
    // One sample per bucket.
    assert_eq!(sample_count(&entries, "a"), 2);
}

#[test]
fn test_samples_capture_fields() {
    let mut producer = producer(GaugeSampling::AllTriggerEvents, None);
    producer.on_matched_event(WHAT, &event(1_000, "a", 42));

    let entries = entries(&mut producer, 5_000);
    let sample = &entries[0].buckets[0].samples[0];
    assert_eq!(sample.elapsed_ns, 1_000);
    assert_eq!(sample.fields[1], FieldValue::Long(42));
}

#[test]
fn test_pulled_gauge_ignores_pushed_events() {
    let mut producer = producer(GaugeSampling::AllTriggerEvents, Some(100));
    assert_eq!(producer.pulled_atom_id(), Some(100));
    producer.on_matched_event(WHAT, &event(1_000, "a", 1));
    assert!(entries(&mut producer, 5_000).is_empty());
}

#[test]
fn test_pulled_gauge_samples_pulled_events() {
    let mut producer = producer(GaugeSampling::AllTriggerEvents, Some(100));
    producer.on_pulled_events(2_000, &[event(2_000, "a", 1), event(2_000, "b", 2)]);

    let entries = entries(&mut producer, 5_000);
    assert_eq!(sample_count(&entries, "a"), 1);
    assert_eq!(sample_count(&entries, "b"), 1);
}

#[test]
fn test_trigger_matcher_forces_sample() {
    let mut producer = producer(GaugeSampling::FirstNSamples(1), None);
    producer.on_matched_event(WHAT, &event(1_000, "a", 1));
    // The cap is reached, but trigger events always sample.
    producer.on_matched_event(TRIGGER, &event(2_000, "a", 2));

    let entries = entries(&mut producer, 5_000);
    assert_eq!(sample_count(&entries, "a"), 2);
}
