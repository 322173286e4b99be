//! Per-config metrics manager
//!
//! One manager per active configuration. Construction compiles the
//! config's matchers, condition trackers and producers; `on_log_event`
//! runs the per-event dispatch: match vector, activation edges, condition
//! pass, condition-change fan-out, then matched-event dispatch. The
//! manager also owns report assembly, byte sizing, TTL bookkeeping and the
//! restricted data path.

use std::collections::HashMap;
use std::sync::Arc;

use tally_config::{
    ConfigError, ConfigKey, MatcherKind, MetricKind, PredicateKind, StateAtomConfig, TallyConfig,
};
use tally_event::Event;
use tally_storage::{ActiveConfig, ActiveMetric, ConfigMetadata, RestrictedStore};

use crate::activation::ActivationSet;
use crate::anomaly::AnomalyTracker;
use crate::condition::{build_condition_trackers, ConditionState, ConditionTracker};
use crate::limits::{
    DEFAULT_TRIGGER_BYTES, MAX_METRICS_BYTES_PER_CONFIG, RESTRICTED_TRIGGER_FLUSH_BYTES,
};
use crate::matcher::MatcherIndex;
use crate::metrics::{
    CountMetricProducer, DurationMetricProducer, GaugeMetricProducer, KllMetricProducer,
    MetricCommon, Producer, RestrictedEventProducer, StateLink, ValueMetricProducer,
};
use crate::pull::PullerManager;
use crate::report::{collect_strings, ConfigMetricsReport, DumpReportReason, UidSnapshot};
use crate::state::StateChange;
use crate::stats::EngineStats;
use crate::uid::UidMap;

#[derive(Debug)]
pub struct MetricsManager {
    key: ConfigKey,
    config: TallyConfig,
    /// Elapsed time past which the config must be reset; `i64::MAX` when
    /// the config has no TTL
    ttl_end_ns: i64,

    matcher_index: MatcherIndex,
    conditions: Vec<ConditionTracker>,

    producers: Vec<Producer>,
    restricted_producers: Vec<RestrictedEventProducer>,

    /// matcher slot -> producer slots driven by it
    matcher_to_producers: HashMap<usize, Vec<usize>>,
    /// matcher slot -> restricted producer slots driven by it
    matcher_to_restricted: HashMap<usize, Vec<usize>>,
    /// matcher slot -> producer slots with an activation edge on it
    matcher_to_activations: HashMap<usize, Vec<usize>>,
    /// condition tracker slot -> producer slots linked to it
    condition_to_producers: HashMap<usize, Vec<usize>>,
    /// condition tracker slot -> restricted producer slots linked to it
    condition_to_restricted: HashMap<usize, Vec<usize>>,

    /// Last observed per-producer active state, to detect transitions
    active_cache: Vec<bool>,

    max_metrics_bytes: usize,
    trigger_bytes: usize,
    persist_locally: bool,

    last_report_time_ns: i64,
    last_report_wall_ns: i64,

    stats: Arc<EngineStats>,
}

impl MetricsManager {
    /// Compile a validated config. Returns `Err` when validation fails;
    /// the caller must not keep a manager for an invalid config.
    pub fn new(
        key: ConfigKey,
        config: &TallyConfig,
        time_base_ns: i64,
        created_ns: i64,
        stats: Arc<EngineStats>,
    ) -> Result<Self, ConfigError> {
        tally_config::validate(config)?;

        let matcher_index = MatcherIndex::build(&config.matchers)?;
        let (conditions, condition_slot_by_id) =
            build_condition_trackers(&config.predicates, &matcher_index)?;

        let mut manager = Self {
            key,
            config: config.clone(),
            ttl_end_ns: match config.ttl_ns {
                Some(ttl) => created_ns + ttl,
                None => i64::MAX,
            },
            matcher_index,
            conditions,
            producers: Vec::new(),
            restricted_producers: Vec::new(),
            matcher_to_producers: HashMap::new(),
            matcher_to_restricted: HashMap::new(),
            matcher_to_activations: HashMap::new(),
            condition_to_producers: HashMap::new(),
            condition_to_restricted: HashMap::new(),
            active_cache: Vec::new(),
            max_metrics_bytes: config
                .max_metrics_bytes
                .unwrap_or(MAX_METRICS_BYTES_PER_CONFIG)
                .min(MAX_METRICS_BYTES_PER_CONFIG),
            trigger_bytes: config.trigger_bytes.unwrap_or(DEFAULT_TRIGGER_BYTES),
            persist_locally: config.persist_locally,
            last_report_time_ns: created_ns,
            last_report_wall_ns: 0,
            stats,
        };

        manager.build_producers(config, &condition_slot_by_id, time_base_ns, created_ns)?;
        manager.seed_initial_conditions(created_ns);
        manager.active_cache = manager
            .producers
            .iter()
            .map(|p| p.is_active(created_ns))
            .collect();
        Ok(manager)
    }

    fn build_producers(
        &mut self,
        config: &TallyConfig,
        condition_slot_by_id: &HashMap<i64, usize>,
        time_base_ns: i64,
        created_ns: i64,
    ) -> Result<(), ConfigError> {
        let restricted = config.is_restricted();

        for metric in &config.metrics {
            let condition_index = match metric.condition {
                None => None,
                Some(id) => Some(*condition_slot_by_id.get(&id).ok_or_else(|| {
                    ConfigError::unknown_reference("metric", metric.id, "predicate", id)
                })?),
            };

            // The matcher that carries this metric's data.
            let primary_matcher_id = match &metric.kind {
                MetricKind::Count { what }
                | MetricKind::Value { what, .. }
                | MetricKind::Gauge { what, .. }
                | MetricKind::Kll { what, .. } => Some(*what),
                MetricKind::Duration { .. } => None,
            };

            if restricted {
                let slot = self.restricted_producers.len();
                let what_slot = match primary_matcher_id {
                    Some(id) => self.resolve_matcher(metric.id, id)?,
                    None => {
                        // Durations buffer their start events.
                        let (start, _, _, _) =
                            self.duration_predicate(config, metric.id, &metric.kind)?;
                        start
                    }
                };
                self.matcher_to_restricted
                    .entry(what_slot)
                    .or_default()
                    .push(slot);
                if let Some(cond) = condition_index {
                    self.condition_to_restricted
                        .entry(cond)
                        .or_default()
                        .push(slot);
                }
                self.restricted_producers.push(RestrictedEventProducer::new(
                    self.key,
                    metric.id,
                    what_slot,
                    condition_index,
                    config.restricted_data_ttl_days,
                ));
                continue;
            }

            let activations = ActivationSet::new(&metric.activations, |id| {
                self.matcher_index.index_of(id)
            });
            let state_links: Vec<StateLink> = metric
                .state_atoms
                .iter()
                .filter_map(|atom_id| {
                    config
                        .states
                        .iter()
                        .find(|s| s.atom_id == *atom_id)
                        .map(|s| StateLink {
                            atom_id: s.atom_id,
                            keyed_by_uid: !s.primary_fields.is_empty(),
                        })
                })
                .collect();
            let common = MetricCommon::new(
                metric,
                self.key,
                time_base_ns,
                created_ns,
                condition_index,
                activations,
                state_links,
                Arc::clone(&self.stats),
            );

            let producer_slot = self.producers.len();
            let producer = match &metric.kind {
                MetricKind::Count { what } => {
                    let what_slot = self.resolve_matcher(metric.id, *what)?;
                    self.link_matcher(what_slot, producer_slot);
                    Producer::Count(CountMetricProducer::new(common, what_slot))
                }
                MetricKind::Duration { aggregation, .. } => {
                    let (start, stop, stop_all, nested) =
                        self.duration_predicate(config, metric.id, &metric.kind)?;
                    self.link_matcher(start, producer_slot);
                    if let Some(stop) = stop {
                        self.link_matcher(stop, producer_slot);
                    }
                    if let Some(stop_all) = stop_all {
                        self.link_matcher(stop_all, producer_slot);
                    }
                    Producer::Duration(DurationMetricProducer::new(
                        common, start, stop, stop_all, nested, *aggregation,
                    ))
                }
                MetricKind::Value {
                    what,
                    value_field,
                    aggregation,
                } => {
                    let what_slot = self.resolve_matcher(metric.id, *what)?;
                    self.link_matcher(what_slot, producer_slot);
                    Producer::Value(ValueMetricProducer::new(
                        common,
                        what_slot,
                        *value_field,
                        *aggregation,
                    ))
                }
                MetricKind::Gauge {
                    what,
                    sampling,
                    trigger,
                    pulled,
                } => {
                    let what_slot = self.resolve_matcher(metric.id, *what)?;
                    self.link_matcher(what_slot, producer_slot);
                    let trigger_slot = match trigger {
                        Some(id) => {
                            let slot = self.resolve_matcher(metric.id, *id)?;
                            self.link_matcher(slot, producer_slot);
                            Some(slot)
                        }
                        None => None,
                    };
                    let pulled_atom = if *pulled {
                        self.simple_matcher_atom(config, *what)
                    } else {
                        None
                    };
                    Producer::Gauge(GaugeMetricProducer::new(
                        common,
                        what_slot,
                        trigger_slot,
                        *sampling,
                        pulled_atom,
                    ))
                }
                MetricKind::Kll { what, value_field } => {
                    let what_slot = self.resolve_matcher(metric.id, *what)?;
                    self.link_matcher(what_slot, producer_slot);
                    Producer::Kll(KllMetricProducer::new(common, what_slot, *value_field))
                }
            };

            if let Some(cond) = condition_index {
                self.condition_to_producers
                    .entry(cond)
                    .or_default()
                    .push(producer_slot);
            }
            for activation in &metric.activations {
                for matcher_id in std::iter::once(activation.activation_matcher)
                    .chain(activation.deactivation_matcher)
                {
                    if let Some(slot) = self.matcher_index.index_of(matcher_id) {
                        let entry = self.matcher_to_activations.entry(slot).or_default();
                        if !entry.contains(&producer_slot) {
                            entry.push(producer_slot);
                        }
                    }
                }
            }

            self.producers.push(producer);
        }

        // Attach anomaly trackers to their producers.
        for alert in &config.alerts {
            let Some(producer) = self
                .producers
                .iter_mut()
                .find(|p| p.metric_id() == alert.metric_id)
            else {
                continue;
            };
            producer.add_anomaly_tracker(AnomalyTracker::new(
                alert.clone(),
                self.key,
                Arc::clone(&self.stats),
            ));
        }
        Ok(())
    }

    fn resolve_matcher(&self, metric_id: i64, matcher_id: i64) -> Result<usize, ConfigError> {
        self.matcher_index.index_of(matcher_id).ok_or_else(|| {
            ConfigError::unknown_reference("metric", metric_id, "matcher", matcher_id)
        })
    }

    /// Start/stop/stopAll matcher slots and nesting flag of a duration
    /// metric's what-predicate
    fn duration_predicate(
        &self,
        config: &TallyConfig,
        metric_id: i64,
        kind: &MetricKind,
    ) -> Result<(usize, Option<usize>, Option<usize>, bool), ConfigError> {
        let MetricKind::Duration { what, .. } = kind else {
            unreachable!("caller checked the metric family");
        };
        let predicate = config
            .predicates
            .iter()
            .find(|p| p.id == *what)
            .ok_or_else(|| {
                ConfigError::unknown_reference("metric", metric_id, "predicate", *what)
            })?;
        let PredicateKind::Simple(simple) = &predicate.kind else {
            return Err(ConfigError::invalid_value(
                "metric",
                metric_id,
                "what",
                "duration metrics must name a simple predicate",
            ));
        };
        let start_id = simple.start.ok_or_else(|| {
            ConfigError::invalid_value("metric", metric_id, "what", "duration predicate has no start")
        })?;
        let start = self.resolve_matcher(metric_id, start_id)?;
        let stop = match simple.stop {
            Some(id) => Some(self.resolve_matcher(metric_id, id)?),
            None => None,
        };
        let stop_all = match simple.stop_all {
            Some(id) => Some(self.resolve_matcher(metric_id, id)?),
            None => None,
        };
        Ok((start, stop, stop_all, simple.count_nesting))
    }

    fn simple_matcher_atom(&self, config: &TallyConfig, matcher_id: i64) -> Option<i32> {
        config.matchers.iter().find(|m| m.id == matcher_id).and_then(|m| match &m.kind {
            MatcherKind::Simple(simple) => Some(simple.atom_id),
            MatcherKind::Combination(_) => None,
        })
    }

    fn link_matcher(&mut self, matcher_slot: usize, producer_slot: usize) {
        let entry = self.matcher_to_producers.entry(matcher_slot).or_default();
        if !entry.contains(&producer_slot) {
            entry.push(producer_slot);
        }
    }

    /// Seed producer condition caches with the trackers' initial states
    fn seed_initial_conditions(&mut self, created_ns: i64) {
        let mut cache: Vec<ConditionState> = Vec::with_capacity(self.conditions.len());
        for tracker in &self.conditions {
            let state = tracker.initial_state(&cache);
            cache.push(state);
        }
        for producer in &mut self.producers {
            if let Some(cond) = producer.condition_index() {
                producer.on_condition_changed(cache[cond], created_ns);
            }
        }
        for producer in &mut self.restricted_producers {
            if let Some(cond) = producer.condition_index() {
                producer.on_condition_changed(cache[cond]);
            }
        }
    }

    pub fn key(&self) -> ConfigKey {
        self.key
    }

    pub fn metric_ids(&self) -> Vec<i64> {
        self.config.metric_ids()
    }

    pub fn state_atom_configs(&self) -> &[StateAtomConfig] {
        &self.config.states
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    pub fn has_restricted_delegate(&self) -> bool {
        self.config.restricted_metrics_delegate.is_some()
    }

    pub fn restricted_delegate(&self) -> Option<&str> {
        self.config.restricted_metrics_delegate.as_deref()
    }

    /// Whether `calling_uid` belongs to the delegate package
    pub fn validate_restricted_delegate(&self, calling_uid: i32, uid_map: &UidMap) -> bool {
        self.restricted_delegate()
            .is_some_and(|package| uid_map.package_uids(package).contains(&calling_uid))
    }

    pub fn max_metrics_bytes(&self) -> usize {
        self.max_metrics_bytes
    }

    pub fn trigger_bytes(&self) -> usize {
        if self.has_restricted_delegate() {
            RESTRICTED_TRIGGER_FLUSH_BYTES
        } else {
            self.trigger_bytes
        }
    }

    pub fn should_persist_local_history(&self) -> bool {
        self.persist_locally
    }

    pub fn should_write_to_disk(&self) -> bool {
        !self.producers.is_empty() || !self.restricted_producers.is_empty()
    }

    pub fn last_report_time_ns(&self) -> i64 {
        self.last_report_time_ns
    }

    pub fn is_in_ttl(&self, ts_ns: i64) -> bool {
        ts_ns < self.ttl_end_ns
    }

    pub fn refresh_ttl(&mut self, now_ns: i64) {
        if let Some(ttl) = self.config.ttl_ns {
            self.ttl_end_ns = now_ns + ttl;
        }
    }

    /// Whether any metric is currently active
    pub fn is_active(&self, now_ns: i64) -> bool {
        if self.producers.is_empty() {
            return true;
        }
        self.producers.iter().any(|p| p.is_active(now_ns))
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    pub fn on_log_event(&mut self, event: &Event) {
        let ts = event.elapsed_timestamp_ns();
        if !self.matcher_index.interested_in(event.tag_id()) {
            return;
        }
        let matched = self.matcher_index.evaluate(event);
        if !matched.iter().any(|&hit| hit) {
            return;
        }

        // Activation edges first, so this event's data respects windows
        // it opens.
        for (slot, &hit) in matched.iter().enumerate() {
            if !hit {
                continue;
            }
            if let Some(producer_slots) = self.matcher_to_activations.get(&slot) {
                for &p in producer_slots {
                    self.producers[p].on_matched_activation(slot, ts);
                }
            }
        }
        // A producer whose active state flipped cuts its bucket.
        for (p, producer) in self.producers.iter_mut().enumerate() {
            let active = producer.is_active(ts);
            if active != self.active_cache[p] {
                producer.flush_current_bucket(ts);
                self.active_cache[p] = active;
                self.stats.note_active_status_changed();
            }
        }

        // Condition pass, child before parent.
        let mut cache: Vec<ConditionState> = Vec::with_capacity(self.conditions.len());
        let mut changed_flags: Vec<bool> = Vec::with_capacity(self.conditions.len());
        for tracker in self.conditions.iter_mut() {
            let (state, changed) = tracker.evaluate(event, &matched, &cache, &self.stats);
            cache.push(state);
            changed_flags.push(changed);
        }

        // Fan condition edges out to linked producers.
        for (cond_slot, tracker) in self.conditions.iter().enumerate() {
            let sliced = tracker.is_sliced();
            let changed_to_true = tracker.changed_to_true();
            let changed_to_false = tracker.changed_to_false();
            let has_slice_changes =
                sliced && (!changed_to_true.is_empty() || !changed_to_false.is_empty());
            if !changed_flags[cond_slot] && !has_slice_changes {
                continue;
            }
            if let Some(producer_slots) = self.condition_to_producers.get(&cond_slot) {
                for &p in producer_slots {
                    if sliced {
                        self.producers[p].on_sliced_condition_may_change(
                            cache[cond_slot],
                            changed_to_true,
                            changed_to_false,
                            ts,
                        );
                    } else {
                        self.producers[p].on_condition_changed(cache[cond_slot], ts);
                    }
                }
            }
            if changed_flags[cond_slot]
                && let Some(slots) = self.condition_to_restricted.get(&cond_slot)
            {
                for &p in slots {
                    self.restricted_producers[p].on_condition_changed(cache[cond_slot]);
                }
            }
        }

        // Matched-event dispatch.
        for (slot, &hit) in matched.iter().enumerate() {
            if !hit {
                continue;
            }
            if let Some(producer_slots) = self.matcher_to_producers.get(&slot) {
                for &p in producer_slots {
                    self.producers[p].on_matched_event(slot, event);
                }
            }
            if let Some(slots) = self.matcher_to_restricted.get(&slot) {
                for &p in slots {
                    self.restricted_producers[p].on_matched_event(slot, event);
                }
            }
        }
    }

    /// Forward a state transition to producers joined on the atom
    pub fn on_state_changed(&mut self, ts_ns: i64, change: &StateChange) {
        for producer in &mut self.producers {
            producer.on_state_changed(ts_ns, change.atom_id, &change.primary_key, &change.new_state);
        }
    }

    // ------------------------------------------------------------------
    // Buckets, reports, sizing
    // ------------------------------------------------------------------

    pub fn byte_size(&self) -> usize {
        let regular: usize = self.producers.iter().map(|p| p.byte_size()).sum();
        let restricted: usize = self.restricted_producers.iter().map(|p| p.byte_size()).sum();
        regular + restricted
    }

    pub fn drop_data(&mut self, drop_time_ns: i64) {
        for producer in &mut self.producers {
            producer.drop_data(drop_time_ns);
        }
        for producer in &mut self.restricted_producers {
            producer.drop_data();
        }
    }

    pub fn flush_all(&mut self, now_ns: i64) {
        for producer in &mut self.producers {
            producer.flush_if_needed(now_ns);
        }
    }

    /// Assemble the in-memory snapshot. Restricted managers produce an
    /// empty report; their data lives in the SQL store.
    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        wall_clock_ns: i64,
        include_partial: bool,
        erase: bool,
        reason: DumpReportReason,
        uid_map: &UidMap,
    ) -> ConfigMetricsReport {
        let mut report = ConfigMetricsReport {
            metrics: Vec::new(),
            uid_snapshot: None,
            last_report_elapsed_ns: self.last_report_time_ns,
            current_report_elapsed_ns: dump_time_ns,
            last_report_wall_ns: self.last_report_wall_ns,
            current_report_wall_ns: wall_clock_ns,
            dump_reason: Some(reason),
            strings: Vec::new(),
            data_corrupted_reasons: self.stats.data_corrupted_reasons(),
        };
        if self.has_restricted_delegate() {
            tracing::warn!(config = %self.key, "dump report requested for restricted config");
            return report;
        }
        for producer in &mut self.producers {
            report
                .metrics
                .push(producer.on_dump_report(dump_time_ns, include_partial, erase));
        }
        if !report.metrics.is_empty() {
            report.uid_snapshot = Some(UidSnapshot {
                snapshot_elapsed_ns: dump_time_ns,
                entries: uid_map.snapshot_entries(),
            });
        }
        report.strings = collect_strings(&report);
        if erase {
            self.last_report_time_ns = dump_time_ns;
            self.last_report_wall_ns = wall_clock_ns;
        }
        report
    }

    // ------------------------------------------------------------------
    // Restricted data path
    // ------------------------------------------------------------------

    /// No-op for non-restricted managers
    pub fn flush_restricted_data(&mut self, store: &mut dyn RestrictedStore) {
        for producer in &mut self.restricted_producers {
            producer.flush(store);
        }
    }

    pub fn enforce_restricted_ttls(&self, store: &mut dyn RestrictedStore, wall_clock_ns: i64) {
        for producer in &self.restricted_producers {
            producer.enforce_ttl(store, wall_clock_ns);
        }
    }

    // ------------------------------------------------------------------
    // Alarms and pulls
    // ------------------------------------------------------------------

    pub fn earliest_anomaly_alarm_ns(&self) -> Option<i64> {
        self.producers
            .iter()
            .filter_map(|p| p.earliest_anomaly_alarm_ns())
            .min()
    }

    pub fn on_anomaly_alarm_fired(&mut self, now_ns: i64) {
        for producer in &mut self.producers {
            producer.on_anomaly_alarm_fired(now_ns);
        }
    }

    pub fn on_pull_alarm_fired(&mut self, ts_ns: i64, pullers: &mut PullerManager) {
        for producer in &mut self.producers {
            if let Some(atom_id) = producer.pulled_atom_id()
                && let Some(events) = pullers.pull(atom_id, ts_ns)
            {
                producer.on_pulled_events(ts_ns, &events);
            }
        }
    }

    pub fn on_periodic_alarm_fired(&mut self, ts_ns: i64, alarm_ids: &[i64]) {
        for alarm in &self.config.alarms {
            if alarm_ids.contains(&alarm.id) {
                tracing::debug!(config = %self.key, alarm = alarm.id, ts_ns, "periodic alarm");
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle notifications
    // ------------------------------------------------------------------

    pub fn notify_app_upgrade(&mut self, ts_ns: i64) {
        for producer in &mut self.producers {
            producer.notify_app_upgrade(ts_ns);
        }
    }

    pub fn on_boot_completed(&mut self, ts_ns: i64) {
        for producer in &mut self.producers {
            producer.on_boot_completed(ts_ns);
        }
    }

    // ------------------------------------------------------------------
    // Persistence round-trips
    // ------------------------------------------------------------------

    /// Activation state of every metric, for the active-config record
    pub fn active_config_record(&self, now_ns: i64) -> ActiveConfig {
        ActiveConfig {
            uid: self.key.uid(),
            id: self.key.id(),
            metrics: self
                .producers
                .iter()
                .map(|p| ActiveMetric {
                    metric_id: p.metric_id(),
                    activations: p.activation_records(now_ns),
                })
                .collect(),
        }
    }

    pub fn load_active_config_record(&mut self, record: &ActiveConfig, now_ns: i64) {
        for metric_record in &record.metrics {
            if let Some(producer) = self
                .producers
                .iter_mut()
                .find(|p| p.metric_id() == metric_record.metric_id)
            {
                producer.load_activation_records(&metric_record.activations, now_ns);
            }
        }
        self.active_cache = self
            .producers
            .iter()
            .map(|p| p.is_active(now_ns))
            .collect();
    }

    /// Anomaly refractory metadata; `None` when there is nothing to keep
    pub fn metadata_record(&self, elapsed_to_wall_sec: i64) -> Option<ConfigMetadata> {
        let alerts: Vec<_> = self
            .producers
            .iter()
            .flat_map(|p| p.refractory_metadata(elapsed_to_wall_sec))
            .collect();
        if alerts.is_empty() {
            return None;
        }
        Some(ConfigMetadata {
            uid: self.key.uid(),
            id: self.key.id(),
            alerts,
        })
    }

    pub fn load_metadata_record(&mut self, record: &ConfigMetadata, wall_to_elapsed_sec: i64) {
        for producer in &mut self.producers {
            producer.load_refractory_metadata(&record.alerts, wall_to_elapsed_sec);
        }
    }
}
