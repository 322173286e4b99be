//! End-to-end processor tests
//!
//! Drives the full pipeline: config upload, event dispatch, condition
//! tracking, bucketing, the flush/broadcast engine, privileged atom
//! fixups, persistence round-trips and restricted queries.

use std::sync::{Arc, Mutex};

use tally_config::{
    ActivationConfig, ActivationType, ConfigKey, DimensionPosition, InitialValue, MatcherConfig,
    MatcherKind, MetricConfig, MetricKind, PredicateConfig, PredicateKind, SimpleMatcher,
    SimplePredicate, TallyConfig,
};
use tally_engine::processor::{
    AllowAllPermissions, Processor, ProcessorCallbacks, ProcessorOptions,
};
use tally_engine::query::{InvalidQueryReason, QueryCallback};
use tally_engine::report::{ConfigMetricsReportList, DumpReportReason, MetricReportData};
use tally_engine::uid::UidMap;
use tally_event::{Event, FieldValue};
use tally_storage::{decode_frame, MemoryRestrictedStore, QueryRows, Storage};
use tempfile::TempDir;

const NS_PER_SEC: i64 = 1_000_000_000;
const BUCKET: i64 = 10_000;

const ATOM_DATA: i32 = 100;
const ATOM_COND_START: i32 = 200;
const ATOM_COND_STOP: i32 = 201;

#[derive(Default)]
struct BroadcastLog {
    data_ready: Mutex<Vec<ConfigKey>>,
    activations: Mutex<Vec<(i32, Vec<i64>)>>,
    restricted: Mutex<Vec<(ConfigKey, String, Vec<i64>)>>,
}

fn callbacks(log: &Arc<BroadcastLog>) -> ProcessorCallbacks {
    let data = Arc::clone(log);
    let act = Arc::clone(log);
    let restricted = Arc::clone(log);
    ProcessorCallbacks {
        send_broadcast: Box::new(move |key| {
            data.data_ready.lock().unwrap().push(*key);
            true
        }),
        send_activation_broadcast: Box::new(move |uid, ids| {
            act.activations.lock().unwrap().push((uid, ids.to_vec()));
            true
        }),
        send_restricted_metrics_broadcast: Box::new(move |key, package, ids| {
            restricted
                .restricted
                .lock()
                .unwrap()
                .push((*key, package.to_string(), ids.to_vec()));
        }),
    }
}

fn processor(dir: &TempDir, log: &Arc<BroadcastLog>) -> Processor {
    processor_with_options(dir, log, ProcessorOptions::default())
}

fn processor_with_options(
    dir: &TempDir,
    log: &Arc<BroadcastLog>,
    options: ProcessorOptions,
) -> Processor {
    Processor::new(
        Storage::open(dir.path()).unwrap(),
        Arc::new(UidMap::new()),
        0,
        options,
        callbacks(log),
        Box::new(AllowAllPermissions),
        Some(Box::new(MemoryRestrictedStore::new(3))),
    )
}

fn simple_matcher(id: i64, atom_id: i32) -> MatcherConfig {
    MatcherConfig {
        id,
        kind: MatcherKind::Simple(SimpleMatcher {
            atom_id,
            field_predicates: Vec::new(),
        }),
    }
}

/// One count metric on ATOM_DATA sliced by field 1, gated by a condition
/// driven by ATOM_COND_START / ATOM_COND_STOP
fn count_config() -> TallyConfig {
    TallyConfig {
        matchers: vec![
            simple_matcher(1, ATOM_DATA),
            simple_matcher(2, ATOM_COND_START),
            simple_matcher(3, ATOM_COND_STOP),
        ],
        predicates: vec![PredicateConfig {
            id: 5,
            kind: PredicateKind::Simple(SimplePredicate {
                start: Some(2),
                stop: Some(3),
                stop_all: None,
                count_nesting: true,
                initial_value: InitialValue::False,
                output_dimensions: Vec::new(),
            }),
        }],
        metrics: vec![MetricConfig {
            id: 10,
            kind: MetricKind::Count { what: 1 },
            bucket_size_ns: BUCKET,
            condition: Some(5),
            dimensions: vec![DimensionPosition::Field(1)],
            state_atoms: Vec::new(),
            threshold: None,
            activations: Vec::new(),
        }],
        ..Default::default()
    }
}

fn data_event(ts: i64, dim: &str) -> Event {
    Event::new(ATOM_DATA, ts)
        .with_wall_clock_ns(ts)
        .with_field(FieldValue::Str(dim.into()))
}

fn dump_list(processor: &Processor, key: ConfigKey, dump_ns: i64, erase: bool) -> ConfigMetricsReportList {
    let payload = processor.on_dump_report(
        key,
        dump_ns,
        dump_ns,
        true,
        erase,
        DumpReportReason::GetDataCalled,
    );
    let (list, _) = decode_frame(&payload).unwrap();
    list
}

/// Count buckets per dimension across every report in the list
fn counts(list: &ConfigMetricsReportList) -> Vec<(String, i64, i64, i64)> {
    let mut out = Vec::new();
    for report in &list.reports {
        for metric in &report.metrics {
            if let MetricReportData::Count { entries } = &metric.data {
                for entry in entries {
                    let dim = match entry.dimension.what().values().first() {
                        Some(FieldValue::Str(s)) => s.clone(),
                        other => format!("{other:?}"),
                    };
                    for bucket in &entry.buckets {
                        out.push((dim.clone(), bucket.start_ns, bucket.end_ns, bucket.count));
                    }
                }
            }
        }
    }
    out.sort();
    out
}

// ============================================================================
// Scenario: count with condition
// ============================================================================

#[test]
fn test_count_with_condition() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    processor.on_config_updated(0, 0, key, &count_config(), false);

    for mut event in [
        Event::new(ATOM_COND_START, 1_000),
        data_event(1_500, "a"),
        data_event(2_000, "b"),
        Event::new(ATOM_COND_STOP, 2_500),
        data_event(3_000, "a"),
    ] {
        let ts = event.elapsed_timestamp_ns();
        processor.on_log_event(&mut event, ts);
    }

    let list = dump_list(&processor, key, 5_000, false);
    assert_eq!(
        counts(&list),
        vec![
            ("a".to_string(), 0, 5_000, 1),
            ("b".to_string(), 0, 5_000, 1),
        ]
    );
}

// ============================================================================
// Scenario: byte-size guardrail
// ============================================================================

#[test]
fn test_byte_size_guardrail_drops_without_broadcast() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    config.max_metrics_bytes = Some(1);
    processor.on_config_updated(0, 0, key, &config, false);

    let mut event = data_event(1_000, "some-dimension");
    processor.on_log_event(&mut event, 1_000);

    let stats = processor.stats().snapshot();
    assert_eq!(stats.data_dropped, 1);
    assert!(stats.bytes_dropped > 0);
    assert!(log.data_ready.lock().unwrap().is_empty());

    // The buffered data is gone.
    let list = dump_list(&processor, key, 5_000, false);
    assert!(counts(&list).is_empty());
}

#[test]
fn test_trigger_bytes_requests_dump_broadcast() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    config.trigger_bytes = Some(1);
    processor.on_config_updated(0, 0, key, &config, false);

    let mut event = data_event(1_000, "a");
    processor.on_log_event(&mut event, 1_000);

    assert_eq!(log.data_ready.lock().unwrap().as_slice(), &[key]);
    assert_eq!(processor.stats().snapshot().broadcasts_sent, 1);
}

#[test]
fn test_broadcast_rate_limited_per_config() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    config.trigger_bytes = Some(1);
    processor.on_config_updated(0, 0, key, &config, false);

    let mut event = data_event(1_000, "a");
    processor.on_log_event(&mut event, 1_000);
    // Second check runs past the byte-size check period but inside the
    // broadcast period.
    let later = 15 * NS_PER_SEC;
    let mut event = data_event(later, "a");
    processor.on_log_event(&mut event, later);

    assert_eq!(log.data_ready.lock().unwrap().len(), 1);
    assert_eq!(processor.stats().snapshot().broadcast_guardrail_hits, 1);
}

// ============================================================================
// Scenario: activation broadcast rate limit
// ============================================================================

fn activation_config() -> TallyConfig {
    let mut config = count_config();
    config.metrics[0].condition = None;
    config.metrics[0].activations = vec![ActivationConfig {
        activation_matcher: 2,
        ttl_ns: 60 * NS_PER_SEC,
        activation_type: ActivationType::ActivateImmediately,
        deactivation_matcher: Some(3),
    }];
    config
}

#[test]
fn test_activation_broadcast_rate_limit() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);
    processor.on_config_updated(0, 0, key, &activation_config(), false);

    // Activation opens: broadcast goes out.
    let mut event = Event::new(ATOM_COND_START, 1_000);
    processor.on_log_event(&mut event, 1_000);
    assert_eq!(log.activations.lock().unwrap().len(), 1);
    assert_eq!(log.activations.lock().unwrap()[0], (1000, vec![1]));

    // Deactivation inside the rate-limit window: guardrail hit, no call.
    let mut event = Event::new(ATOM_COND_STOP, 2_000);
    processor.on_log_event(&mut event, 2_000);
    assert_eq!(log.activations.lock().unwrap().len(), 1);
    assert_eq!(
        processor.stats().snapshot().activation_broadcast_guardrail_hits,
        1
    );

    // Past the window the broadcast flows again.
    let later = 11 * NS_PER_SEC;
    let mut event = Event::new(ATOM_COND_START, later);
    processor.on_log_event(&mut event, later);
    assert_eq!(log.activations.lock().unwrap().len(), 2);
}

#[test]
fn test_get_active_configs() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);
    processor.on_config_updated(0, 0, key, &activation_config(), false);

    assert!(processor.get_active_configs(1000, 500).is_empty());
    let mut event = Event::new(ATOM_COND_START, 1_000);
    processor.on_log_event(&mut event, 1_000);
    assert_eq!(processor.get_active_configs(1000, 2_000), vec![1]);
}

// ============================================================================
// Scenario: train info
// ============================================================================

fn binary_push_event(ts: i64, train: &str, version: i64, status: i32, ids: &[i64]) -> Event {
    Event::new(102, ts)
        .with_uid(123_456)
        .with_field(FieldValue::Str(train.into()))
        .with_field(FieldValue::Long(version))
        .with_field(FieldValue::Bool(false))
        .with_field(FieldValue::Bool(true))
        .with_field(FieldValue::Bool(false))
        .with_field(FieldValue::Long(i64::from(status)))
        .with_field(FieldValue::Bytes(serde_json::to_vec(ids).unwrap()))
        .with_field(FieldValue::Int(0))
        .with_field(FieldValue::Int(0))
        .with_field(FieldValue::Bool(false))
}

fn watchdog_event(ts: i64, rollback_type: i32, package: &str) -> Event {
    Event::new(104, ts)
        .with_field(FieldValue::Int(rollback_type))
        .with_field(FieldValue::Str(package.into()))
        .with_field(FieldValue::Int(0))
        .with_field(FieldValue::Int(0))
        .with_field(FieldValue::Int(0))
        .with_field(FieldValue::Bytes(Vec::new()))
}

#[test]
fn test_train_info_scenario() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);

    // Event A: install success appends firstId + 1.
    let mut event_a = binary_push_event(1_000, "X", 7, 5 /* install success */, &[100]);
    processor.on_log_event(&mut event_a, 1_000);

    let storage = Storage::open(dir.path()).unwrap();
    let info = storage.read_train_info("X").unwrap();
    assert_eq!(info.version_code, 7);
    assert_eq!(info.experiment_ids, vec![100, 101]);

    // The event was patched in place.
    let patched: Vec<i64> = serde_json::from_slice(event_a.bytes_at(7).unwrap()).unwrap();
    assert_eq!(patched, vec![100, 101]);
    assert_eq!(event_a.int_at(8).unwrap(), 1); // 123456 / 100000

    // Event B: watchdog rollback initiate on package "X" appends firstId + 4.
    let mut event_b = watchdog_event(2_000, 1 /* initiate */, "X");
    processor.on_log_event(&mut event_b, 2_000);

    let info = storage.read_train_info("X").unwrap();
    assert_eq!(info.experiment_ids, vec![100, 101, 104]);
    let patched: Vec<i64> = serde_json::from_slice(event_b.bytes_at(6).unwrap()).unwrap();
    assert_eq!(patched, vec![100, 101, 104]);

    // Idempotent under repeat with the same type.
    let mut event_c = watchdog_event(3_000, 1, "X");
    processor.on_log_event(&mut event_c, 3_000);
    let info = storage.read_train_info("X").unwrap();
    assert_eq!(info.experiment_ids, vec![100, 101, 104]);
}

#[test]
fn test_watchdog_rollback_empty_package_is_noop() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);

    let mut event = watchdog_event(1_000, 1, "");
    processor.on_log_event(&mut event, 1_000);
    let patched: Vec<i64> = serde_json::from_slice(event.bytes_at(6).unwrap()).unwrap();
    assert!(patched.is_empty());
}

struct DenyAll;

impl tally_engine::processor::PermissionChecker for DenyAll {
    fn has_permission(&self, _permission: &str, _pid: i32, _uid: i32) -> bool {
        false
    }
}

#[test]
fn test_unprivileged_caller_loses_binary_push_event() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = Processor::new(
        Storage::open(dir.path()).unwrap(),
        Arc::new(UidMap::new()),
        0,
        ProcessorOptions::default(),
        callbacks(&log),
        Box::new(DenyAll),
        None,
    );

    let mut event = binary_push_event(1_000, "X", 7, 5, &[100]);
    processor.on_log_event(&mut event, 1_000);

    // Nothing was written and the event was not patched.
    let storage = Storage::open(dir.path()).unwrap();
    assert!(storage.read_train_info("X").is_none());
    let ids: Vec<i64> = serde_json::from_slice(event.bytes_at(7).unwrap()).unwrap();
    assert_eq!(ids, vec![100]);
}

// ============================================================================
// Scenario: partial bucket on config update
// ============================================================================

#[test]
fn test_partial_bucket_on_config_update() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    processor.on_config_updated(0, 0, key, &config, false);

    let mut event = data_event(1_000, "a");
    processor.on_log_event(&mut event, 1_000);

    // Config update at t=5000 cuts the bucket; current data is persisted.
    processor.on_config_updated(5_000, 5_000, key, &config, false);

    let mut event = data_event(6_000, "a");
    processor.on_log_event(&mut event, 6_000);

    let list = dump_list(&processor, key, BUCKET, false);
    let counts = counts(&list);
    // The historical partial [0,5000) and the current [5000,10000)
    // together cover what one full bucket would have counted.
    assert_eq!(
        counts,
        vec![
            ("a".to_string(), 0, 5_000, 1),
            ("a".to_string(), 5_000, 10_000, 1),
        ]
    );
    let total: i64 = counts.iter().map(|(_, _, _, c)| c).sum();
    assert_eq!(total, 2);
}

// ============================================================================
// Config lifecycle
// ============================================================================

#[test]
fn test_config_removed_forgets_key() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    config.trigger_bytes = Some(1);
    processor.on_config_updated(0, 0, key, &config, false);

    let mut event = data_event(1_000, "a");
    processor.on_log_event(&mut event, 1_000);
    assert_eq!(log.data_ready.lock().unwrap().len(), 1);

    processor.on_config_removed(key, 2_000, 2_000);
    assert_eq!(processor.get_metrics_size(key), 0);

    // Repeat removal is safe.
    processor.on_config_removed(key, 3_000, 3_000);

    // Later events never mention the key again.
    let later = 30 * NS_PER_SEC;
    let mut event = data_event(later, "a");
    processor.on_log_event(&mut event, later);
    assert_eq!(log.data_ready.lock().unwrap().len(), 1);
}

#[test]
fn test_invalid_config_erases_manager() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    processor.on_config_updated(0, 0, key, &config, false);
    let mut event = data_event(1_000, "a");
    processor.on_log_event(&mut event, 1_000);
    assert!(processor.get_metrics_size(key) > 0);

    // A bad update erases the previous manager entirely.
    let mut bad = count_config();
    bad.metrics[0].condition = Some(999);
    processor.on_config_updated(2_000, 2_000, key, &bad, false);
    assert_eq!(processor.get_metrics_size(key), 0);
    assert_eq!(processor.stats().snapshot().invalid_configs, 1);
}

#[test]
fn test_config_ttl_expiry_rebuilds_from_backup() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    config.ttl_ns = Some(5_000);
    processor.on_config_updated(0, 0, key, &config, false);

    let mut event = data_event(1_000, "a");
    processor.on_log_event(&mut event, 1_000);

    // An event past the ttl persists the old data and rebuilds the config.
    let mut event = data_event(6_000, "a");
    processor.on_log_event(&mut event, 6_000);
    assert_eq!(processor.stats().snapshot().configs_reset, 1);

    // The manager is still there and still counting.
    let mut event = data_event(7_000, "a");
    processor.on_log_event(&mut event, 7_000);
    assert!(processor.get_metrics_size(key) > 0);
}

// ============================================================================
// Persistence round-trips
// ============================================================================

#[test]
fn test_active_configs_round_trip() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let key = ConfigKey::new(1000, 1);

    let processor_a = processor(&dir, &log);
    processor_a.on_config_updated(0, 0, key, &activation_config(), false);
    let mut event = Event::new(ATOM_COND_START, 1_000);
    processor_a.on_log_event(&mut event, 1_000);
    assert_eq!(processor_a.get_active_configs(1000, 2_000), vec![1]);
    // Past the disk cool-down window; the activation has ~40s of ttl left.
    processor_a.save_active_configs_to_disk(20 * NS_PER_SEC);

    // A restarted engine reloads the config, then the activation state.
    let processor_b = processor(&dir, &log);
    processor_b.on_config_updated(0, 0, key, &activation_config(), false);
    assert!(processor_b.get_active_configs(1000, 100).is_empty());
    processor_b.load_active_configs_from_disk(100);
    assert_eq!(processor_b.get_active_configs(1000, 200), vec![1]);
}

#[test]
fn test_disk_write_cool_down() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    processor.on_config_updated(0, 0, key, &config, false);

    let mut event = data_event(1_000, "a");
    processor.on_log_event(&mut event, 1_000);
    processor.write_data_to_disk(DumpReportReason::DeviceShutdown, 20 * NS_PER_SEC, 20 * NS_PER_SEC);

    let mut event = data_event(21 * NS_PER_SEC, "a");
    processor.on_log_event(&mut event, 21 * NS_PER_SEC);
    // Second write lands inside the cool-down and is refused.
    processor.write_data_to_disk(
        DumpReportReason::DeviceShutdown,
        21 * NS_PER_SEC,
        21 * NS_PER_SEC,
    );

    let storage = Storage::open(dir.path()).unwrap();
    assert_eq!(storage.read_reports_for(&key, false).unwrap().len(), 1);
}

#[test]
fn test_metadata_round_trip_preserves_refractory() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    config.alerts = vec![tally_config::AlertConfig {
        id: 77,
        metric_id: 10,
        num_buckets: 1,
        trigger_if_sum_gt: 1,
        refractory_period_secs: 3_600,
    }];

    let processor_a = processor(&dir, &log);
    processor_a.on_config_updated(0, 0, key, &config, false);
    for ts in [1_000, 2_000] {
        let mut event = data_event(ts, "a");
        processor_a.on_log_event(&mut event, ts);
    }
    assert_eq!(processor_a.stats().snapshot().anomalies_declared, 1);
    // Past the disk cool-down window; wall and elapsed clocks agree.
    processor_a.save_metadata_to_disk(20 * NS_PER_SEC, 20 * NS_PER_SEC);

    // The restarted engine honors the persisted refractory window.
    let processor_b = processor(&dir, &log);
    processor_b.on_config_updated(0, 0, key, &config, false);
    processor_b.load_metadata_from_disk(4_000, 4_000);
    for ts in [5_000, 6_000] {
        let mut event = data_event(ts, "a");
        processor_b.on_log_event(&mut event, ts);
    }
    assert_eq!(processor_b.stats().snapshot().anomalies_declared, 0);
}

// ============================================================================
// Restricted queries
// ============================================================================

#[derive(Default)]
struct RecordingCallback {
    results: Option<QueryRows>,
    failure: Option<(String, InvalidQueryReason)>,
}

impl QueryCallback for RecordingCallback {
    fn send_results(&mut self, rows: QueryRows) {
        self.results = Some(rows);
    }

    fn send_failure(&mut self, error: &str, reason: InvalidQueryReason) {
        self.failure = Some((error.to_string(), reason));
    }
}

fn restricted_config() -> TallyConfig {
    let mut config = count_config();
    config.metrics[0].condition = None;
    config.restricted_metrics_delegate = Some("com.example.delegate".to_string());
    config
}

#[test]
fn test_restricted_query_flag_disabled() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor_with_options(
        &dir,
        &log,
        ProcessorOptions {
            restricted_metrics_enabled: false,
            ..Default::default()
        },
    );

    let mut callback = RecordingCallback::default();
    processor.query_sql("select 1", 1, &mut callback, 1, "pkg", 42, 0, 0);
    assert_eq!(
        callback.failure.unwrap().1,
        InvalidQueryReason::FlagDisabled
    );
}

#[test]
fn test_restricted_query_version_too_new() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);

    let mut callback = RecordingCallback::default();
    processor.query_sql("select 1", 99, &mut callback, 1, "pkg", 42, 0, 0);
    assert_eq!(
        callback.failure.unwrap().1,
        InvalidQueryReason::UnsupportedSqliteVersion
    );
}

#[test]
fn test_restricted_query_unknown_key() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    processor.uid_map().add_app(1000, "com.example.owner", 1);

    let mut callback = RecordingCallback::default();
    processor.query_sql("select 1", 1, &mut callback, 1, "com.example.owner", 42, 0, 0);
    assert_eq!(
        callback.failure.unwrap().1,
        InvalidQueryReason::ConfigKeyNotFound
    );
}

#[test]
fn test_restricted_query_wrong_delegate() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);
    processor.uid_map().add_app(1000, "com.example.owner", 1);
    processor.on_config_updated(0, 0, key, &restricted_config(), false);

    let mut callback = RecordingCallback::default();
    // Caller 9999 is not the delegate.
    processor.query_sql("select 1", 1, &mut callback, 1, "com.example.owner", 9999, 0, 0);
    assert_eq!(
        callback.failure.unwrap().1,
        InvalidQueryReason::ConfigKeyWithUnmatchedDelegate
    );
}

#[test]
fn test_restricted_query_success() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);
    processor.uid_map().add_app(1000, "com.example.owner", 1);
    processor.uid_map().add_app(4242, "com.example.delegate", 1);
    processor.on_config_updated(0, 0, key, &restricted_config(), false);

    // The restricted broadcast announced the metric ids.
    assert_eq!(
        log.restricted.lock().unwrap().as_slice(),
        &[(key, "com.example.delegate".to_string(), vec![10])]
    );

    let mut event = data_event(1_000, "a").with_restricted();
    processor.on_log_event(&mut event, 1_000);

    let mut callback = RecordingCallback::default();
    processor.query_sql(
        "select * from metric_10",
        1,
        &mut callback,
        1,
        "com.example.owner",
        4242,
        2_000,
        2_000,
    );
    let rows = callback.results.expect("query should succeed");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(processor.stats().snapshot().restricted_queries_succeeded, 1);
}

#[test]
fn test_restricted_event_skips_normal_managers() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    processor.on_config_updated(0, 0, key, &config, false);

    let mut event = data_event(1_000, "a").with_restricted();
    processor.on_log_event(&mut event, 1_000);

    // A restricted event never reaches a non-delegate manager.
    let list = dump_list(&processor, key, 5_000, false);
    assert!(counts(&list).is_empty());
}

// ============================================================================
// Breadcrumbs and uid handling
// ============================================================================

#[test]
fn test_app_breadcrumb_validation() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let config = TallyConfig {
        matchers: vec![simple_matcher(1, 47)],
        metrics: vec![MetricConfig {
            id: 10,
            kind: MetricKind::Count { what: 1 },
            bucket_size_ns: BUCKET,
            condition: None,
            dimensions: Vec::new(),
            state_atoms: Vec::new(),
            threshold: None,
            activations: Vec::new(),
        }],
        ..Default::default()
    };
    processor.on_config_updated(0, 0, key, &config, false);

    let breadcrumb = |ts: i64, caller: i32, claimed: i32, state: i32| {
        Event::new(47, ts)
            .with_uid(caller)
            .with_field(FieldValue::Int(claimed))
            .with_field(FieldValue::Str("label".into()))
            .with_field(FieldValue::Int(state))
    };

    // Valid: caller matches the claimed uid, state in range.
    let mut event = breadcrumb(1_000, 500, 500, 1);
    processor.on_log_event(&mut event, 1_000);
    // Spoofed uid: dropped.
    let mut event = breadcrumb(2_000, 500, 501, 1);
    processor.on_log_event(&mut event, 2_000);
    // State out of range: dropped.
    let mut event = breadcrumb(3_000, 500, 500, 4);
    processor.on_log_event(&mut event, 3_000);

    let list = dump_list(&processor, key, 5_000, false);
    let total: i64 = list
        .reports
        .iter()
        .flat_map(|r| &r.metrics)
        .filter_map(|m| match &m.data {
            MetricReportData::Count { entries } => Some(entries),
            _ => None,
        })
        .flatten()
        .flat_map(|e| &e.buckets)
        .map(|b| b.count)
        .sum();
    assert_eq!(total, 1);
}

#[test]
fn test_isolated_uid_normalization() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    // Count sliced by a uid-typed field.
    let mut config = count_config();
    config.metrics[0].condition = None;
    processor.on_config_updated(0, 0, key, &config, false);

    // Register isolated uid 90001 -> host 10001.
    let mut mapping = Event::new(43, 500)
        .with_field(FieldValue::Long(10_001))
        .with_field(FieldValue::Long(90_001))
        .with_field(FieldValue::Bool(true));
    processor.on_log_event(&mut mapping, 500);

    // A data event carrying the isolated uid in a uid field.
    let mut event = Event::new(ATOM_DATA, 1_000).with_field(FieldValue::Int(90_001));
    event.mark_uid_field(1);
    processor.on_log_event(&mut event, 1_000);
    assert_eq!(event.int_at(1).unwrap(), 10_001);
}

// ============================================================================
// Dump report bookkeeping
// ============================================================================

#[test]
fn test_report_number_increments_on_erasing_dumps() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);
    let key = ConfigKey::new(1000, 1);

    let mut config = count_config();
    config.metrics[0].condition = None;
    processor.on_config_updated(0, 0, key, &config, false);

    let list = dump_list(&processor, key, 1_000, false);
    assert_eq!(list.report_number, 0);
    let list = dump_list(&processor, key, 2_000, true);
    assert_eq!(list.report_number, 1);
    let list = dump_list(&processor, key, 3_000, true);
    assert_eq!(list.report_number, 2);
}

#[test]
fn test_anomaly_alarm_slot_cancel_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(BroadcastLog::default());
    let processor = processor(&dir, &log);

    processor.set_anomaly_alarm(5_000);
    processor.cancel_anomaly_alarm();
    // Cancelling twice is safe.
    processor.cancel_anomaly_alarm();
}
