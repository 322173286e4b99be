//! Config parsing tests

use crate::{
    DurationAggregation, GaugeSampling, MatcherKind, MetricKind, TallyConfig, UploadThreshold,
    DEFAULT_BUCKET_SIZE_NS,
};

#[test]
fn test_empty_config_parses() {
    let config = TallyConfig::from_json_str("{}").unwrap();
    assert!(config.matchers.is_empty());
    assert!(config.metrics.is_empty());
    assert!(!config.is_restricted());
    assert!(config.ttl_ns.is_none());
}

#[test]
fn test_minimal_count_metric() {
    let payload = r#"{
        "matchers": [
            {"id": 1, "simple": {"atom_id": 100}}
        ],
        "metrics": [
            {"id": 10, "count": {"what": 1}}
        ]
    }"#;
    let config = TallyConfig::from_json_str(payload).unwrap();
    assert_eq!(config.matchers.len(), 1);
    assert!(matches!(config.matchers[0].kind, MatcherKind::Simple(_)));

    let metric = &config.metrics[0];
    assert!(matches!(metric.kind, MetricKind::Count { what: 1 }));
    assert_eq!(metric.bucket_size_ns, DEFAULT_BUCKET_SIZE_NS);
    assert!(metric.condition.is_none());
    assert!(metric.dimensions.is_empty());
}

#[test]
fn test_duration_defaults_to_sum() {
    let payload = r#"{
        "metrics": [
            {"id": 10, "duration": {"what": 5}}
        ]
    }"#;
    let config = TallyConfig::from_json_str(payload).unwrap();
    match config.metrics[0].kind {
        MetricKind::Duration { what, aggregation } => {
            assert_eq!(what, 5);
            assert_eq!(aggregation, DurationAggregation::Sum);
        }
        _ => panic!("expected duration metric"),
    }
}

#[test]
fn test_gauge_sampling_variants() {
    let payload = r#"{
        "metrics": [
            {"id": 1, "gauge": {"what": 2, "sampling": {"first_n_samples": 3}}}
        ]
    }"#;
    let config = TallyConfig::from_json_str(payload).unwrap();
    match &config.metrics[0].kind {
        MetricKind::Gauge { sampling, .. } => {
            assert_eq!(*sampling, GaugeSampling::FirstNSamples(3));
        }
        _ => panic!("expected gauge metric"),
    }
}

#[test]
fn test_upload_threshold_comparators() {
    assert!(UploadThreshold::GtInt(5).passes(6));
    assert!(!UploadThreshold::GtInt(5).passes(5));
    assert!(UploadThreshold::GteInt(5).passes(5));
    assert!(UploadThreshold::LtInt(5).passes(4));
    assert!(UploadThreshold::LteInt(5).passes(5));
    assert!(!UploadThreshold::LteInt(5).passes(6));
}

#[test]
fn test_round_trip() {
    let payload = r#"{
        "matchers": [{"id": 1, "simple": {"atom_id": 100}}],
        "metrics": [{"id": 10, "count": {"what": 1}, "bucket_size_ns": 10000}],
        "ttl_ns": 500,
        "restricted_metrics_delegate": "com.example.delegate"
    }"#;
    let config = TallyConfig::from_json_str(payload).unwrap();
    let reparsed = TallyConfig::from_json_str(&config.to_json_string()).unwrap();
    assert_eq!(reparsed.metrics[0].bucket_size_ns, 10_000);
    assert_eq!(reparsed.ttl_ns, Some(500));
    assert!(reparsed.is_restricted());
    assert_eq!(reparsed.metric_ids(), vec![10]);
}
