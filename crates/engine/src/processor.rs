//! Central processor
//!
//! Single entry point for event ingress, config lifecycle, dump requests,
//! alarm callbacks, periodic flushes and restricted queries. Two locks in
//! a fixed order: the metrics lock guards the manager map and every
//! per-key bookkeeping map and is held for the whole of each public
//! operation; the anomaly-alarm lock guards only the next-alarm slot and
//! is never held while taking the metrics lock.
//!
//! The host's broadcast callbacks are invoked while the metrics lock is
//! held; they must be non-blocking and must not re-enter the processor.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tally_config::{ConfigKey, TallyConfig};
use tally_event::{Event, FieldValue};
use tally_storage::{
    ActiveConfigList, InstallTrainInfo, MetadataList, RestrictedStore, Storage,
};

use crate::atoms;
use crate::limits::{
    MAX_RESTRICTED_STORE_BYTES, MIN_ACTIVATION_BROADCAST_PERIOD_NS, MIN_BROADCAST_PERIOD_NS,
    MIN_BYTE_SIZE_CHECK_PERIOD_NS, MIN_DB_GUARDRAIL_ENFORCEMENT_PERIOD_NS,
    MIN_FLUSH_RESTRICTED_PERIOD_NS, MIN_TTL_CHECK_PERIOD_NS, NS_PER_SEC, PER_USER_RANGE,
    PULLER_CACHE_CLEAR_INTERVAL_SEC, WRITE_COOL_DOWN_NS,
};
use crate::manager::MetricsManager;
use crate::pull::{AtomPuller, PullerManager};
use crate::query::{InvalidQueryReason, QueryCallback};
use crate::report::{encode_report_list, ConfigMetricsReport, ConfigMetricsReportList, DumpReportReason};
use crate::anomaly::AlarmMonitor;
use crate::state::StateManager;
use crate::stats::EngineStats;
use crate::uid::UidMap;

/// Caller permission seam; the host wires this to its IPC identity checks
pub trait PermissionChecker: Send {
    fn has_permission(&self, permission: &str, pid: i32, uid: i32) -> bool;
}

/// Grants everything; for tests and single-tenant hosts
#[derive(Debug, Default)]
pub struct AllowAllPermissions;

impl PermissionChecker for AllowAllPermissions {
    fn has_permission(&self, _permission: &str, _pid: i32, _uid: i32) -> bool {
        true
    }
}

/// Host callbacks, invoked under the metrics lock
pub struct ProcessorCallbacks {
    /// "data is ready" for a config; true when delivered
    pub send_broadcast: Box<dyn FnMut(&ConfigKey) -> bool + Send>,
    /// Active config ids changed for a uid; true when delivered
    pub send_activation_broadcast: Box<dyn FnMut(i32, &[i64]) -> bool + Send>,
    /// Restricted metric ids available to a delegate package
    pub send_restricted_metrics_broadcast: Box<dyn FnMut(&ConfigKey, &str, &[i64]) + Send>,
}

impl Default for ProcessorCallbacks {
    fn default() -> Self {
        Self {
            send_broadcast: Box::new(|_| false),
            send_activation_broadcast: Box::new(|_, _| false),
            send_restricted_metrics_broadcast: Box::new(|_, _, _| {}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Gates the restricted data path; `false` surfaces FLAG_DISABLED
    pub restricted_metrics_enabled: bool,
    /// Stamped into every report to identify this engine incarnation
    pub engine_instance_id: i64,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            restricted_metrics_enabled: true,
            engine_instance_id: 0,
        }
    }
}

struct Inner {
    managers: BTreeMap<ConfigKey, MetricsManager>,

    last_broadcast_ns: HashMap<ConfigKey, i64>,
    last_activation_broadcast_ns: HashMap<i32, i64>,
    last_byte_size_check_ns: HashMap<ConfigKey, i64>,
    dump_report_numbers: HashMap<ConfigKey, i32>,
    /// Configs with report snapshots on disk awaiting upload
    on_disk_data_configs: BTreeSet<ConfigKey>,

    last_puller_cache_clear_sec: i64,
    last_ttl_check_ns: i64,
    last_restricted_flush_ns: i64,
    last_db_guardrail_ns: i64,
    last_data_write_ns: i64,
    last_active_write_ns: i64,
    last_metadata_write_ns: i64,

    storage: Storage,
    restricted_store: Option<Box<dyn RestrictedStore>>,
    puller_manager: PullerManager,
    state_manager: StateManager,
    periodic_alarms: AlarmMonitor,

    callbacks: ProcessorCallbacks,
    permissions: Box<dyn PermissionChecker>,
    options: ProcessorOptions,

    uid_map: Arc<UidMap>,
    stats: Arc<EngineStats>,
    time_base_ns: i64,
}

/// The central processor
pub struct Processor {
    inner: Mutex<Inner>,
    /// Elapsed ns of the next anomaly alarm; 0 means none. Guarded by its
    /// own lock: never take `inner` while holding it.
    next_anomaly_alarm_ns: Mutex<i64>,
    uid_map: Arc<UidMap>,
    stats: Arc<EngineStats>,
    time_base_ns: i64,
}

impl Processor {
    pub fn new(
        storage: Storage,
        uid_map: Arc<UidMap>,
        time_base_ns: i64,
        options: ProcessorOptions,
        callbacks: ProcessorCallbacks,
        permissions: Box<dyn PermissionChecker>,
        restricted_store: Option<Box<dyn RestrictedStore>>,
    ) -> Self {
        let stats = Arc::new(EngineStats::new());
        Self {
            inner: Mutex::new(Inner {
                managers: BTreeMap::new(),
                last_broadcast_ns: HashMap::new(),
                last_activation_broadcast_ns: HashMap::new(),
                last_byte_size_check_ns: HashMap::new(),
                dump_report_numbers: HashMap::new(),
                on_disk_data_configs: BTreeSet::new(),
                last_puller_cache_clear_sec: 0,
                last_ttl_check_ns: 0,
                last_restricted_flush_ns: 0,
                last_db_guardrail_ns: 0,
                last_data_write_ns: 0,
                last_active_write_ns: 0,
                last_metadata_write_ns: 0,
                storage,
                restricted_store,
                puller_manager: PullerManager::new(),
                state_manager: StateManager::new(),
                periodic_alarms: AlarmMonitor::new(),
                callbacks,
                permissions,
                options,
                uid_map: Arc::clone(&uid_map),
                stats: Arc::clone(&stats),
                time_base_ns,
            }),
            next_anomaly_alarm_ns: Mutex::new(0),
            uid_map,
            stats,
            time_base_ns,
        }
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn uid_map(&self) -> &Arc<UidMap> {
        &self.uid_map
    }

    /// The bucket-alignment anchor shared by every producer
    pub fn time_base_ns(&self) -> i64 {
        self.time_base_ns
    }

    pub fn register_puller(&self, atom_id: i32, puller: Box<dyn AtomPuller>) {
        self.inner.lock().puller_manager.register_puller(atom_id, puller);
    }

    // ------------------------------------------------------------------
    // Event ingress
    // ------------------------------------------------------------------

    /// Dispatch one decoded event. `now_elapsed_ns` is the ingestion
    /// thread's clock reading, used for everything that is not event
    /// time: rate limits, alarms, cool-downs.
    pub fn on_log_event(&self, event: &mut Event, now_elapsed_ns: i64) {
        let mut inner = self.inner.lock();
        let atom_id = event.tag_id();
        let event_ts = event.elapsed_timestamp_ns();
        let wall_ns = event.wall_clock_ns().unwrap_or(0);

        self.stats.note_atom_logged(atom_id);
        if !event.is_valid() {
            self.stats.note_atom_error(atom_id);
            return;
        }

        // Privileged fixups; unauthorized callers lose the event.
        if atom_id == atoms::BINARY_PUSH_STATE_CHANGED {
            if !inner.caller_is_privileged(event) {
                return;
            }
            inner.on_binary_push_state_changed(event);
        }
        if atom_id == atoms::WATCHDOG_ROLLBACK_OCCURRED {
            if !inner.caller_is_privileged(event) {
                return;
            }
            inner.on_watchdog_rollback_occurred(event);
        }

        inner.reset_if_config_ttl_expired(event_ts, now_elapsed_ns, wall_ns);

        // Isolated-uid bookkeeping, or host-uid normalization.
        if atom_id == atoms::ISOLATED_UID_CHANGED {
            inner.on_isolated_uid_changed(event);
        } else {
            let uid_map = Arc::clone(&inner.uid_map);
            event.map_uid_fields(|uid| uid_map.host_uid_or_self(uid));
        }

        let state_change = inner.state_manager.on_log_event(event);

        if inner.managers.is_empty() {
            return;
        }

        // Anomaly alarm check under its own lock; the alarm fires with
        // the metrics lock held, never the reverse.
        let fire_anomaly = {
            let mut slot = self.next_anomaly_alarm_ns.lock();
            if *slot != 0 && *slot <= now_elapsed_ns {
                *slot = 0;
                true
            } else {
                false
            }
        };
        if fire_anomaly {
            tracing::debug!(now_elapsed_ns, "anomaly alarm due, informing managers");
            for manager in inner.managers.values_mut() {
                manager.on_anomaly_alarm_fired(now_elapsed_ns);
            }
        }

        // Periodic maintenance, paced by event time.
        let now_sec = now_elapsed_ns / NS_PER_SEC;
        if now_sec - inner.last_puller_cache_clear_sec > PULLER_CACHE_CLEAR_INTERVAL_SEC {
            inner.puller_manager.clear_cache_if_expired(now_elapsed_ns);
            inner.last_puller_cache_clear_sec = now_sec;
        }
        inner.flush_restricted_if_necessary(now_elapsed_ns);
        inner.enforce_data_ttls_if_necessary(wall_ns, now_elapsed_ns);
        inner.enforce_db_guardrails_if_necessary(now_elapsed_ns);

        if !inner.validate_app_breadcrumb(event) {
            return;
        }

        // Manager fan-out.
        let restricted_event = event.is_restricted();
        let mut uids_with_changes: HashSet<i32> = HashSet::new();
        let mut active_per_uid: HashMap<i32, Vec<i64>> = HashMap::new();
        let keys: Vec<ConfigKey> = inner.managers.keys().copied().collect();
        for key in keys {
            {
                let Some(manager) = inner.managers.get_mut(&key) else {
                    continue;
                };
                if restricted_event && !manager.has_restricted_delegate() {
                    continue;
                }
                let was_active = manager.is_active(event_ts);
                if let Some(change) = &state_change {
                    manager.on_state_changed(event_ts, change);
                }
                manager.on_log_event(event);
                let is_active = manager.is_active(event_ts);
                if is_active {
                    active_per_uid.entry(key.uid()).or_default().push(key.id());
                }
                if was_active != is_active {
                    tracing::debug!(config = %key, is_active, "active status changed");
                    uids_with_changes.insert(key.uid());
                }
            }
            inner.flush_if_necessary(key, now_elapsed_ns);
        }

        // Activation broadcasts last, rate limited per uid against the
        // ingestion clock, not event time.
        for uid in uids_with_changes {
            if let Some(&last) = inner.last_activation_broadcast_ns.get(&uid)
                && now_elapsed_ns - last < MIN_ACTIVATION_BROADCAST_PERIOD_NS
            {
                self.stats.note_activation_broadcast_guardrail_hit(uid);
                continue;
            }
            let ids = active_per_uid.get(&uid).cloned().unwrap_or_default();
            if (inner.callbacks.send_activation_broadcast)(uid, &ids) {
                inner.last_activation_broadcast_ns.insert(uid, now_elapsed_ns);
                self.stats.note_activation_broadcast_sent();
            }
        }

        // Merge the managers' earliest scheduled anomaly alarm into the
        // slot; a manually scheduled alarm is kept if sooner.
        let earliest = inner
            .managers
            .values()
            .filter_map(|m| m.earliest_anomaly_alarm_ns())
            .min()
            .unwrap_or(0);
        drop(inner);
        let mut slot = self.next_anomaly_alarm_ns.lock();
        *slot = match (*slot, earliest) {
            (0, earliest) => earliest,
            (current, 0) => current,
            (current, earliest) => current.min(earliest),
        };
    }

    // ------------------------------------------------------------------
    // Config lifecycle
    // ------------------------------------------------------------------

    pub fn on_config_updated(
        &self,
        timestamp_ns: i64,
        wall_clock_ns: i64,
        key: ConfigKey,
        config: &TallyConfig,
        modular_update: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.write_data_for_key(key, timestamp_ns, wall_clock_ns, DumpReportReason::ConfigUpdated);
        inner.on_config_updated_locked(timestamp_ns, key, config, modular_update);
    }

    pub fn on_config_removed(&self, key: ConfigKey, now_ns: i64, wall_clock_ns: i64) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if inner.managers.contains_key(&key) {
            inner.write_data_for_key(key, now_ns, wall_clock_ns, DumpReportReason::ConfigRemoved);
            let manager = inner.managers.get(&key).expect("checked above");
            if let Some(delegate) = manager.restricted_delegate().map(str::to_owned) {
                if let Some(store) = inner.restricted_store.as_deref_mut() {
                    if store.delete_config(&key).is_ok() {
                        inner.stats.note_restricted_store_deleted();
                    }
                }
                (inner.callbacks.send_restricted_metrics_broadcast)(&key, &delegate, &[]);
            }
            inner.managers.remove(&key);
            inner.uid_map.on_config_removed(key);
        }
        inner.stats.note_config_removed();
        inner.storage.remove_config(&key);

        inner.last_broadcast_ns.remove(&key);
        inner.last_byte_size_check_ns.remove(&key);
        inner.dump_report_numbers.remove(&key);
        inner.on_disk_data_configs.remove(&key);

        let uid = key.uid();
        let last_config_for_uid = !inner.managers.keys().any(|k| k.uid() == uid);
        if last_config_for_uid {
            inner.last_activation_broadcast_ns.remove(&uid);
        }
        if inner.managers.is_empty() {
            inner.puller_manager.force_clear_cache();
        }
        inner.rebuild_state_manager();
    }

    /// Reset every config from its on-disk backup
    pub fn reset_configs(&self, now_ns: i64) {
        let mut inner = self.inner.lock();
        let keys: Vec<ConfigKey> = inner.managers.keys().copied().collect();
        inner.reset_configs_locked(now_ns, &keys);
    }

    // ------------------------------------------------------------------
    // Reports and queries
    // ------------------------------------------------------------------

    /// Assemble the dump payload: historical on-disk reports first, the
    /// in-memory snapshot second.
    pub fn on_dump_report(
        &self,
        key: ConfigKey,
        dump_time_ns: i64,
        wall_clock_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        reason: DumpReportReason,
    ) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let mut list = ConfigMetricsReportList {
            uid: key.uid(),
            id: key.id(),
            report_number: 0,
            engine_instance_id: inner.options.engine_instance_id,
            reports: Vec::new(),
        };

        if inner
            .managers
            .get(&key)
            .is_some_and(|m| m.has_restricted_delegate())
        {
            tracing::warn!(config = %key, "dump report refused for restricted config");
            return encode_report_list(&list);
        }

        let keep_file = inner
            .managers
            .get(&key)
            .is_some_and(|m| m.should_persist_local_history());

        // Historical snapshots from previous sessions.
        match inner.storage.read_reports_for(&key, erase_data && !keep_file) {
            Ok(payloads) => {
                for payload in payloads {
                    match serde_json::from_slice::<ConfigMetricsReport>(&payload) {
                        Ok(report) => list.reports.push(report),
                        Err(e) => {
                            tracing::warn!(config = %key, error = %e,
                                "skipping undecodable historical report");
                        }
                    }
                }
            }
            Err(e) => {
                self.stats.note_storage_failure();
                tracing::error!(config = %key, error = %e, "failed reading historical reports");
            }
        }

        if let Some(manager) = inner.managers.get_mut(&key) {
            // Allow a follow-up broadcast sooner if the buffer refills.
            inner.last_broadcast_ns.remove(&key);
            let report = manager.on_dump_report(
                dump_time_ns,
                wall_clock_ns,
                include_current_partial_bucket,
                erase_data,
                reason,
                &inner.uid_map,
            );
            if erase_data && manager.should_persist_local_history() {
                inner.write_report_snapshot(&key, wall_clock_ns, &report);
            }
            list.reports.push(report);
        } else {
            tracing::warn!(config = %key, "dump report for unknown config");
        }

        if erase_data {
            let number = inner.dump_report_numbers.entry(key).or_insert(0);
            *number += 1;
            self.stats.note_report_sent();
        }
        list.report_number = inner.dump_report_numbers.get(&key).copied().unwrap_or(0);
        encode_report_list(&list)
    }

    pub fn get_active_configs(&self, uid: i32, now_ns: i64) -> Vec<i64> {
        let inner = self.inner.lock();
        inner
            .managers
            .iter()
            .filter(|(key, manager)| key.uid() == uid && manager.is_active(now_ns))
            .map(|(key, _)| key.id())
            .collect()
    }

    pub fn get_metrics_size(&self, key: ConfigKey) -> usize {
        let inner = self.inner.lock();
        match inner.managers.get(&key) {
            Some(manager) => manager.byte_size(),
            None => {
                tracing::warn!(config = %key, "metrics size for unknown config");
                0
            }
        }
    }

    /// Execute SQL over the restricted store after authorization
    #[allow(clippy::too_many_arguments)]
    pub fn query_sql(
        &self,
        sql: &str,
        min_client_version: i32,
        callback: &mut dyn QueryCallback,
        config_id: i64,
        config_package: &str,
        calling_uid: i32,
        now_elapsed_ns: i64,
        wall_clock_ns: i64,
    ) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        if !inner.options.restricted_metrics_enabled {
            self.stats.note_restricted_query_failed();
            callback.send_failure(
                "restricted metrics are disabled on this device",
                InvalidQueryReason::FlagDisabled,
            );
            return;
        }
        let Some(store) = inner.restricted_store.as_deref_mut() else {
            self.stats.note_restricted_query_failed();
            callback.send_failure(
                "no restricted store configured",
                InvalidQueryReason::FlagDisabled,
            );
            return;
        };
        if min_client_version > store.version() {
            self.stats.note_restricted_query_failed();
            callback.send_failure(
                &format!(
                    "unsupported sqlite version: installed {}, requested {}",
                    store.version(),
                    min_client_version
                ),
                InvalidQueryReason::UnsupportedSqliteVersion,
            );
            return;
        }

        // Resolve the config package to uids: well-known principals
        // first, installed packages second.
        let package_uids: HashSet<i32> = match UidMap::well_known_uid(config_package) {
            Some(uid) => HashSet::from([uid]),
            None => inner.uid_map.package_uids(config_package),
        };

        let matched: Vec<ConfigKey> = package_uids
            .iter()
            .map(|&uid| ConfigKey::new(uid, config_id))
            .filter(|key| inner.managers.contains_key(key))
            .collect();
        if matched.is_empty() {
            self.stats.note_restricted_query_failed();
            callback.send_failure(
                "no configs found matching the config key",
                InvalidQueryReason::ConfigKeyNotFound,
            );
            return;
        }
        let authorized: Vec<ConfigKey> = matched
            .iter()
            .copied()
            .filter(|key| {
                inner.managers[key].validate_restricted_delegate(calling_uid, &inner.uid_map)
            })
            .collect();
        if authorized.is_empty() {
            self.stats.note_restricted_query_failed();
            callback.send_failure(
                "no matching configs for restricted metrics delegate",
                InvalidQueryReason::ConfigKeyWithUnmatchedDelegate,
            );
            return;
        }
        if authorized.len() > 1 {
            self.stats.note_restricted_query_failed();
            callback.send_failure("ambiguous config key", InvalidQueryReason::AmbiguousConfigKey);
            return;
        }
        let key = authorized[0];

        // Make the store current before querying.
        for manager in inner.managers.values_mut() {
            manager.flush_restricted_data(store);
            manager.enforce_restricted_ttls(store, wall_clock_ns);
        }
        inner.last_restricted_flush_ns = now_elapsed_ns;
        inner.last_ttl_check_ns = now_elapsed_ns;

        let rows = match store.query(&key, sql) {
            Ok(rows) => rows,
            Err(e) => {
                self.stats.note_restricted_query_failed();
                callback.send_failure(
                    &format!("failed to query store: {e}"),
                    InvalidQueryReason::QueryFailure,
                );
                return;
            }
        };
        if rows.column_names.len() != rows.column_types.len()
            || rows.rows.iter().any(|r| r.len() != rows.column_names.len())
        {
            self.stats.note_restricted_query_failed();
            callback.send_failure("inconsistent row sizes", InvalidQueryReason::InconsistentRowSize);
            return;
        }
        self.stats.note_restricted_query_succeeded();
        callback.send_results(rows);
    }

    // ------------------------------------------------------------------
    // Alarms
    // ------------------------------------------------------------------

    pub fn inform_pull_alarm_fired(&self, timestamp_ns: i64) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        for manager in inner.managers.values_mut() {
            manager.on_pull_alarm_fired(timestamp_ns, &mut inner.puller_manager);
        }
    }

    /// Schedule the single anomaly alarm slot
    pub fn set_anomaly_alarm(&self, timestamp_ns: i64) {
        *self.next_anomaly_alarm_ns.lock() = timestamp_ns;
    }

    /// Idempotent
    pub fn cancel_anomaly_alarm(&self) {
        *self.next_anomaly_alarm_ns.lock() = 0;
    }

    /// Pop and fan out every periodic alarm due at `timestamp_ns`
    pub fn on_periodic_alarm_fired(&self, timestamp_ns: i64) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let fired = inner.periodic_alarms.pop_sooner_than(timestamp_ns / NS_PER_SEC);
        if fired.is_empty() {
            return;
        }
        for manager in inner.managers.values_mut() {
            manager.on_periodic_alarm_fired(timestamp_ns, &fired);
        }
        // Reschedule the fired alarms one period out.
        for (key, manager) in inner.managers.iter() {
            for alarm in &manager.config().alarms {
                if fired.contains(&alarm.id) && alarm.period_millis > 0 {
                    let next_sec = timestamp_ns / NS_PER_SEC + alarm.period_millis / 1000;
                    inner.periodic_alarms.add_alarm(next_sec, alarm.id);
                    tracing::debug!(config = %key, alarm = alarm.id, next_sec, "alarm rescheduled");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle notifications
    // ------------------------------------------------------------------

    pub fn notify_app_upgrade(&self, event_time_ns: i64, package: &str, uid: i32, version: i64) {
        let mut inner = self.inner.lock();
        tracing::debug!(package, uid, version, "app upgraded");
        inner.uid_map.add_app(uid, package, version);
        for manager in inner.managers.values_mut() {
            manager.notify_app_upgrade(event_time_ns);
        }
    }

    pub fn notify_app_removed(&self, event_time_ns: i64, package: &str, uid: i32) {
        let mut inner = self.inner.lock();
        tracing::debug!(package, uid, "app removed");
        inner.uid_map.remove_app(uid, package);
        for manager in inner.managers.values_mut() {
            manager.notify_app_upgrade(event_time_ns);
        }
    }

    /// Boot finished: forces a bucket split and opens armed activations
    pub fn on_boot_completed(&self, elapsed_time_ns: i64) {
        let mut inner = self.inner.lock();
        tracing::info!(elapsed_time_ns, "boot completed");
        for manager in inner.managers.values_mut() {
            manager.on_boot_completed(elapsed_time_ns);
        }
    }

    /// Add a key to the configs with data on disk, so the next byte-size
    /// check requests a dump
    pub fn note_on_disk_data(&self, key: ConfigKey) {
        self.inner.lock().on_disk_data_configs.insert(key);
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Flush every config's buffered data to disk. Data in memory is gone
    /// afterward; restricted configs flush to their store instead.
    pub fn write_data_to_disk(
        &self,
        reason: DumpReportReason,
        elapsed_realtime_ns: i64,
        wall_clock_ns: i64,
    ) {
        let mut inner = self.inner.lock();
        if elapsed_realtime_ns < inner.last_data_write_ns + WRITE_COOL_DOWN_NS {
            tracing::info!("skipping data write, wrote within the cool-down window");
            return;
        }
        inner.last_data_write_ns = elapsed_realtime_ns;
        let keys: Vec<ConfigKey> = inner.managers.keys().copied().collect();
        for key in keys {
            inner.write_data_for_key(key, elapsed_realtime_ns, wall_clock_ns, reason);
        }
    }

    /// Persist per-metric activation state
    pub fn save_active_configs_to_disk(&self, current_time_ns: i64) {
        let mut inner = self.inner.lock();
        if current_time_ns < inner.last_active_write_ns + WRITE_COOL_DOWN_NS {
            tracing::info!("skipping active-config write, wrote within the cool-down window");
            return;
        }
        inner.last_active_write_ns = current_time_ns;
        let list = ActiveConfigList {
            configs: inner
                .managers
                .values()
                .map(|m| m.active_config_record(current_time_ns))
                .collect(),
        };
        if let Err(e) = inner.storage.save_active_configs(&list) {
            self.stats.note_storage_failure();
            tracing::error!(error = %e, "failed writing active configs");
        }
    }

    /// Restore activation state; TTLs rebase against `current_time_ns`
    pub fn load_active_configs_from_disk(&self, current_time_ns: i64) {
        let mut inner = self.inner.lock();
        let Some(list) = inner.storage.load_active_configs() else {
            return;
        };
        for record in &list.configs {
            let key = ConfigKey::new(record.uid, record.id);
            match inner.managers.get_mut(&key) {
                Some(manager) => manager.load_active_config_record(record, current_time_ns),
                None => tracing::warn!(config = %key, "active record for unknown config"),
            }
        }
        tracing::info!(configs = list.configs.len(), "loaded active configs");
    }

    /// Persist anomaly refractory metadata, anchored to wall time
    pub fn save_metadata_to_disk(&self, current_wall_clock_ns: i64, system_elapsed_ns: i64) {
        let mut inner = self.inner.lock();
        if system_elapsed_ns < inner.last_metadata_write_ns + WRITE_COOL_DOWN_NS {
            tracing::info!("skipping metadata write, wrote within the cool-down window");
            return;
        }
        inner.last_metadata_write_ns = system_elapsed_ns;
        let elapsed_to_wall_sec =
            current_wall_clock_ns / NS_PER_SEC - system_elapsed_ns / NS_PER_SEC;
        let list = MetadataList {
            entries: inner
                .managers
                .values()
                .filter_map(|m| m.metadata_record(elapsed_to_wall_sec))
                .collect(),
        };
        if let Err(e) = inner.storage.save_metadata(&list) {
            self.stats.note_storage_failure();
            tracing::error!(error = %e, "failed writing metadata");
        }
    }

    pub fn load_metadata_from_disk(&self, current_wall_clock_ns: i64, system_elapsed_ns: i64) {
        let mut inner = self.inner.lock();
        let Some(list) = inner.storage.load_metadata() else {
            return;
        };
        let wall_to_elapsed_sec =
            system_elapsed_ns / NS_PER_SEC - current_wall_clock_ns / NS_PER_SEC;
        for record in &list.entries {
            let key = ConfigKey::new(record.uid, record.id);
            match inner.managers.get_mut(&key) {
                Some(manager) => manager.load_metadata_record(record, wall_to_elapsed_sec),
                None => tracing::warn!(config = %key, "metadata for unknown config"),
            }
        }
    }

    /// Expire restricted rows past their TTL, unconditionally
    pub fn enforce_data_ttls(&self, wall_clock_ns: i64, elapsed_realtime_ns: i64) {
        let mut inner = self.inner.lock();
        if !inner.options.restricted_metrics_enabled {
            return;
        }
        inner.enforce_data_ttls_locked(wall_clock_ns, elapsed_realtime_ns);
    }
}

impl Inner {
    fn caller_is_privileged(&self, event: &Event) -> bool {
        let pid = event.pid();
        let uid = event.uid();
        self.permissions
            .has_permission(atoms::PERMISSION_DUMP, pid, uid)
            && self
                .permissions
                .has_permission(atoms::PERMISSION_PACKAGE_USAGE_STATS, pid, uid)
    }

    fn rebuild_state_manager(&mut self) {
        let configs = self
            .managers
            .values()
            .flat_map(|m| m.state_atom_configs().iter());
        self.state_manager.rebuild(configs);
    }

    // ------------------------------------------------------------------
    // Hard-coded atom handlers
    // ------------------------------------------------------------------

    fn on_isolated_uid_changed(&mut self, event: &Event) {
        let parent_uid = event.long_at(1).map(|v| v as i32);
        let isolated_uid = event.long_at(2).map(|v| v as i32);
        let is_create = event.bool_at(3);
        match (parent_uid, isolated_uid, is_create) {
            (Ok(parent), Ok(isolated), Ok(true)) => {
                self.uid_map.assign_isolated_uid(isolated, parent);
            }
            (Ok(_), Ok(isolated), Ok(false)) => {
                self.uid_map.remove_isolated_uid(isolated);
            }
            _ => {
                tracing::error!("failed to parse isolated uid change event");
            }
        }
    }

    /// Fill in whatever the binary-push event is missing from the on-disk
    /// train record, append the status marker ids, and persist the result.
    fn on_binary_push_state_changed(&mut self, event: &mut Event) {
        let parsed = (|| -> Result<(InstallTrainInfo, bool), tally_event::EventError> {
            let info = InstallTrainInfo {
                train_name: event.str_at(1)?.to_string(),
                version_code: event.long_at(2)?,
                requires_staging: event.bool_at(3)?,
                rollback_enabled: event.bool_at(4)?,
                requires_low_latency_monitor: event.bool_at(5)?,
                status: event.long_at(6)? as i32,
                experiment_ids: Vec::new(),
            };
            let blob = event.bytes_at(7)?;
            let experiment_ids = decode_experiment_ids(blob);
            let is_rollback = event.bool_at(10)?;
            Ok((
                InstallTrainInfo {
                    experiment_ids,
                    ..info
                },
                is_rollback,
            ))
        })();
        let (mut info, is_rollback) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(error = %e, "failed to parse binary push state changed event");
                return;
            }
        };

        self.update_train_info_on_disk(is_rollback, &mut info);

        let user_id = event.uid() / PER_USER_RANGE;
        let _ = event.set_value(2, FieldValue::Long(info.version_code));
        let _ = event.set_value(7, FieldValue::Bytes(encode_experiment_ids(&info.experiment_ids)));
        let _ = event.set_value(8, FieldValue::Int(user_id));
        if is_rollback {
            // The rollback event's own bits are stale; the disk record wins.
            let _ = event.set_value(3, FieldValue::Bool(info.requires_staging));
            let _ = event.set_value(4, FieldValue::Bool(info.rollback_enabled));
            let _ = event.set_value(5, FieldValue::Bool(info.requires_low_latency_monitor));
        }
    }

    fn update_train_info_on_disk(&mut self, is_rollback: bool, info: &mut InstallTrainInfo) {
        // Without a train name there is nothing to attribute the event to.
        if info.train_name.is_empty() {
            return;
        }
        let on_disk = self.storage.read_train_info(&info.train_name);

        let mut reset_experiment_ids = false;
        if let Some(disk) = &on_disk {
            // Keep the old train version if we received an empty one.
            if info.version_code == -1 {
                info.version_code = disk.version_code;
            } else if info.version_code != disk.version_code {
                reset_experiment_ids = true;
            }
            if !info.experiment_ids.is_empty()
                && (disk.experiment_ids.is_empty()
                    || info.experiment_ids[0] != disk.experiment_ids[0])
            {
                reset_experiment_ids = true;
            }
        }

        if (!reset_experiment_ids || is_rollback)
            && let Some(disk) = &on_disk
        {
            info.experiment_ids = disk.experiment_ids.clone();
        }

        if let Some(&first_id) = info.experiment_ids.first() {
            let marker = match info.status {
                atoms::BINARY_PUSH_INSTALL_SUCCESS => {
                    Some(first_id + atoms::MARKER_INSTALL_SUCCESS)
                }
                atoms::BINARY_PUSH_ROLLBACK_INITIATED => {
                    Some(first_id + atoms::MARKER_ROLLBACK_INITIATED)
                }
                atoms::BINARY_PUSH_ROLLBACK_SUCCESS => {
                    Some(first_id + atoms::MARKER_ROLLBACK_SUCCESS)
                }
                _ => None,
            };
            if let Some(marker) = marker
                && !info.experiment_ids.contains(&marker)
            {
                info.experiment_ids.push(marker);
            }
        }

        if is_rollback && let Some(disk) = &on_disk {
            info.requires_staging = disk.requires_staging;
            info.rollback_enabled = disk.rollback_enabled;
            info.requires_low_latency_monitor = disk.requires_low_latency_monitor;
        }

        if let Err(e) = self.storage.write_train_info(info) {
            self.stats.note_storage_failure();
            tracing::error!(train = %info.train_name, error = %e, "failed writing train record");
        }
    }

    fn on_watchdog_rollback_occurred(&mut self, event: &mut Event) {
        let (rollback_type, package_name) = match (event.long_at(1), event.str_at(2)) {
            (Ok(rollback_type), Ok(package)) => (rollback_type as i32, package.to_string()),
            _ => {
                tracing::error!("failed to parse watchdog rollback occurred event");
                return;
            }
        };
        let experiment_ids = self.process_watchdog_rollback(rollback_type, &package_name);
        let _ = event.set_value(6, FieldValue::Bytes(encode_experiment_ids(&experiment_ids)));
    }

    /// Append the watchdog marker for the package's train and return the
    /// final id list. Idempotent for a repeated rollback type.
    fn process_watchdog_rollback(&mut self, rollback_type: i32, package_name: &str) -> Vec<i64> {
        if package_name.is_empty() {
            return Vec::new();
        }
        // The package name doubles as the train name.
        let Some(mut info) = self.storage.read_train_info(package_name) else {
            return Vec::new();
        };
        let Some(&first_id) = info.experiment_ids.first() else {
            return Vec::new();
        };
        let marker = match rollback_type {
            atoms::WATCHDOG_ROLLBACK_INITIATE => {
                Some(first_id + atoms::MARKER_WATCHDOG_ROLLBACK_INITIATE)
            }
            atoms::WATCHDOG_ROLLBACK_SUCCESS => {
                Some(first_id + atoms::MARKER_WATCHDOG_ROLLBACK_SUCCESS)
            }
            _ => None,
        };
        if let Some(marker) = marker {
            if !info.experiment_ids.contains(&marker) {
                info.experiment_ids.push(marker);
            }
            if let Err(e) = self.storage.write_train_info(&info) {
                self.stats.note_storage_failure();
                tracing::error!(train = package_name, error = %e, "failed writing train record");
            }
        }
        info.experiment_ids
    }

    fn validate_app_breadcrumb(&self, event: &Event) -> bool {
        if event.tag_id() != atoms::APP_BREADCRUMB_REPORTED {
            return true;
        }
        // Schema is (uid, label, state): uid at 1, state at 3.
        let Ok(claimed_uid) = event.long_at(1) else {
            tracing::debug!("breadcrumb event with unreadable uid field");
            return false;
        };
        let logger_uid = self.uid_map.host_uid_or_self(event.uid());
        if i64::from(logger_uid) != claimed_uid && logger_uid != atoms::ENGINE_UID {
            tracing::debug!(
                claimed_uid,
                logger_uid,
                "breadcrumb uid does not match caller"
            );
            return false;
        }
        match event.long_at(3) {
            Ok(state) if (0..=3).contains(&state) => true,
            Ok(state) => {
                tracing::debug!(state, "breadcrumb state out of range");
                false
            }
            Err(_) => {
                tracing::debug!("breadcrumb event with unreadable state field");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Config plumbing
    // ------------------------------------------------------------------

    fn on_config_updated_locked(
        &mut self,
        timestamp_ns: i64,
        key: ConfigKey,
        config: &TallyConfig,
        mut modular_update: bool,
    ) {
        tracing::debug!(config = %key, modular_update, "configuration updated");
        let old_delegate = self
            .managers
            .get(&key)
            .and_then(|m| m.restricted_delegate().map(str::to_owned));

        // A change in restricted-delegate presence is never modular.
        if self.managers.contains_key(&key) && old_delegate.is_some() != config.is_restricted() {
            modular_update = false;
        }
        if !modular_update
            && old_delegate.is_some()
            && let Some(store) = self.restricted_store.as_deref_mut()
        {
            if store.delete_config(&key).is_ok() {
                self.stats.note_restricted_store_deleted();
            }
        }

        match MetricsManager::new(
            key,
            config,
            self.time_base_ns,
            timestamp_ns,
            Arc::clone(&self.stats),
        ) {
            Ok(mut manager) => {
                manager.refresh_ttl(timestamp_ns);
                if modular_update && let Some(old) = self.managers.get(&key) {
                    // Modular update: keep the reporting cadence and open
                    // activation windows of the previous incarnation.
                    let record = old.active_config_record(timestamp_ns);
                    manager.load_active_config_record(&record, timestamp_ns);
                }
                if let Some(delegate) = manager.restricted_delegate().map(str::to_owned) {
                    let metric_ids = manager.metric_ids();
                    (self.callbacks.send_restricted_metrics_broadcast)(
                        &key,
                        &delegate,
                        &metric_ids,
                    );
                    if let Some(store) = self.restricted_store.as_deref_mut()
                        && let Err(e) = store.ensure_device_table(&key)
                    {
                        tracing::error!(config = %key, error = %e,
                            "failed to create device table for restricted config");
                    }
                    self.uid_map.on_config_removed(key);
                } else {
                    if let Some(old_delegate) = &old_delegate {
                        (self.callbacks.send_restricted_metrics_broadcast)(&key, old_delegate, &[]);
                    }
                    self.uid_map.on_config_updated(key);
                }
                self.managers.insert(key, manager);
                if let Err(e) = self.storage.save_config(&key, config) {
                    self.stats.note_storage_failure();
                    tracing::error!(config = %key, error = %e, "failed writing config backup");
                }
                self.stats.note_config_added();
            }
            Err(e) => {
                // An invalid config never leaves a manager behind.
                tracing::error!(config = %key, error = %e, "invalid configuration rejected");
                self.stats.note_invalid_config();
                if let Some(old_delegate) = &old_delegate {
                    (self.callbacks.send_restricted_metrics_broadcast)(&key, old_delegate, &[]);
                    if let Some(store) = self.restricted_store.as_deref_mut() {
                        let _ = store.delete_config(&key);
                    }
                }
                self.managers.remove(&key);
                self.uid_map.on_config_removed(key);
                self.storage.remove_config(&key);
            }
        }

        // Register this config's periodic alarms.
        for alarm in &config.alarms {
            let first_sec = (self.time_base_ns / NS_PER_SEC)
                + (alarm.offset_millis + alarm.period_millis) / 1000;
            self.periodic_alarms.add_alarm(first_sec, alarm.id);
        }

        self.rebuild_state_manager();
    }

    fn reset_configs_locked(&mut self, timestamp_ns: i64, keys: &[ConfigKey]) {
        for &key in keys {
            match self.storage.read_config(&key) {
                Some(config) => {
                    // A reset is always a full rebuild.
                    self.on_config_updated_locked(timestamp_ns, key, &config, false);
                    self.stats.note_config_reset();
                }
                None => {
                    tracing::error!(config = %key, "failed to read config backup for reset");
                    if let Some(manager) = self.managers.get_mut(&key) {
                        manager.refresh_ttl(timestamp_ns);
                    }
                }
            }
        }
    }

    fn reset_if_config_ttl_expired(&mut self, event_ts_ns: i64, now_ns: i64, wall_ns: i64) {
        let expired: Vec<ConfigKey> = self
            .managers
            .iter()
            .filter(|(_, manager)| !manager.is_in_ttl(event_ts_ns))
            .map(|(key, _)| *key)
            .collect();
        if expired.is_empty() {
            return;
        }
        tracing::info!(count = expired.len(), "config ttls expired, resetting");
        if now_ns >= self.last_data_write_ns + WRITE_COOL_DOWN_NS {
            self.last_data_write_ns = now_ns;
            let keys: Vec<ConfigKey> = self.managers.keys().copied().collect();
            for key in keys {
                self.write_data_for_key(key, now_ns, wall_ns, DumpReportReason::ConfigReset);
            }
        }
        self.reset_configs_locked(event_ts_ns, &expired);
    }

    // ------------------------------------------------------------------
    // Flush and broadcast engine
    // ------------------------------------------------------------------

    fn flush_if_necessary(&mut self, key: ConfigKey, now_ns: i64) {
        if let Some(&last) = self.last_byte_size_check_ns.get(&key)
            && now_ns - last < MIN_BYTE_SIZE_CHECK_PERIOD_NS
        {
            return;
        }

        // byteSize() is assumed expensive, hence the rate limit above.
        let Some(manager) = self.managers.get_mut(&key) else {
            return;
        };
        let total_bytes = manager.byte_size();
        let max_bytes = manager.max_metrics_bytes();
        let trigger_bytes = manager.trigger_bytes();
        let restricted = manager.has_restricted_delegate();
        self.last_byte_size_check_ns.insert(key, now_ns);

        if total_bytes > max_bytes {
            // Too late to upload; the data is dropped, not grown.
            manager.drop_data(now_ns);
            self.stats.note_data_dropped(total_bytes);
            tracing::warn!(config = %key, total_bytes, "metrics over byte budget, dropped");
            return;
        }
        let request_dump =
            total_bytes > trigger_bytes || self.on_disk_data_configs.contains(&key);
        if !request_dump {
            return;
        }

        if restricted {
            if let Some(store) = self.restricted_store.as_deref_mut() {
                manager.flush_restricted_data(store);
            }
            // No broadcast for restricted configs.
            return;
        }

        if let Some(&last) = self.last_broadcast_ns.get(&key)
            && now_ns - last < MIN_BROADCAST_PERIOD_NS
        {
            self.stats.note_broadcast_guardrail_hit();
            return;
        }
        if (self.callbacks.send_broadcast)(&key) {
            tracing::debug!(config = %key, total_bytes, "data fetch triggered");
            self.on_disk_data_configs.remove(&key);
            self.last_broadcast_ns.insert(key, now_ns);
            self.stats.note_broadcast_sent();
        }
    }

    /// Persist one config's current data as a snapshot awaiting upload
    fn write_data_for_key(
        &mut self,
        key: ConfigKey,
        timestamp_ns: i64,
        wall_clock_ns: i64,
        reason: DumpReportReason,
    ) {
        let Some(manager) = self.managers.get_mut(&key) else {
            return;
        };
        if !manager.should_write_to_disk() {
            return;
        }
        if manager.has_restricted_delegate() {
            if let Some(store) = self.restricted_store.as_deref_mut() {
                manager.flush_restricted_data(store);
            }
            return;
        }
        let report = manager.on_dump_report(
            timestamp_ns,
            wall_clock_ns,
            true, // include the current partial bucket
            true, // erase
            reason,
            &self.uid_map,
        );
        self.write_report_snapshot(&key, wall_clock_ns, &report);
        // Data reached disk; trigger collection at the next opportunity.
        self.on_disk_data_configs.insert(key);
    }

    fn write_report_snapshot(&mut self, key: &ConfigKey, wall_clock_ns: i64, report: &ConfigMetricsReport) {
        let payload = match serde_json::to_vec(report) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(config = %key, error = %e, "report serialization failed");
                return;
            }
        };
        if let Err(e) =
            self.storage
                .write_report_snapshot(wall_clock_ns / NS_PER_SEC, key, &payload)
        {
            self.stats.note_storage_failure();
            tracing::error!(config = %key, error = %e, "failed writing report snapshot");
        }
    }

    // ------------------------------------------------------------------
    // Restricted maintenance
    // ------------------------------------------------------------------

    fn flush_restricted_if_necessary(&mut self, now_ns: i64) {
        if !self.options.restricted_metrics_enabled {
            return;
        }
        if now_ns - self.last_restricted_flush_ns < MIN_FLUSH_RESTRICTED_PERIOD_NS {
            return;
        }
        let Some(store) = self.restricted_store.as_deref_mut() else {
            return;
        };
        for manager in self.managers.values_mut() {
            manager.flush_restricted_data(store);
        }
        self.last_restricted_flush_ns = now_ns;
    }

    fn enforce_data_ttls_if_necessary(&mut self, wall_ns: i64, now_ns: i64) {
        if !self.options.restricted_metrics_enabled {
            return;
        }
        if now_ns - self.last_ttl_check_ns < MIN_TTL_CHECK_PERIOD_NS {
            return;
        }
        self.enforce_data_ttls_locked(wall_ns, now_ns);
    }

    fn enforce_data_ttls_locked(&mut self, wall_ns: i64, now_ns: i64) {
        let Some(store) = self.restricted_store.as_deref_mut() else {
            return;
        };
        for manager in self.managers.values() {
            manager.enforce_restricted_ttls(store, wall_ns);
        }
        self.last_ttl_check_ns = now_ns;
    }

    fn enforce_db_guardrails_if_necessary(&mut self, now_ns: i64) {
        if now_ns - self.last_db_guardrail_ns < MIN_DB_GUARDRAIL_ENFORCEMENT_PERIOD_NS {
            return;
        }
        if let Some(store) = self.restricted_store.as_deref_mut()
            && let Err(e) = store.enforce_guardrails(MAX_RESTRICTED_STORE_BYTES)
        {
            tracing::error!(error = %e, "restricted store guardrail enforcement failed");
        }
        self.last_db_guardrail_ns = now_ns;
    }
}

/// Experiment-id blobs are frames of the external serializer; here that
/// is a JSON array of i64
fn decode_experiment_ids(blob: &[u8]) -> Vec<i64> {
    if blob.is_empty() {
        return Vec::new();
    }
    match serde_json::from_slice(blob) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "failed to parse experiment ids blob");
            Vec::new()
        }
    }
}

/// Inverse of `decode_experiment_ids`
pub fn encode_experiment_ids(ids: &[i64]) -> Vec<u8> {
    serde_json::to_vec(ids).expect("id list serialization is infallible")
}
