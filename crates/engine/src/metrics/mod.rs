//! Metric producers
//!
//! One producer per configured metric. All producers share the same
//! contract: matched events arrive with the per-event matcher vector
//! already computed, condition changes arrive as edges, buckets close on
//! crossing events or forced cuts, and reports drain on dump. The shared
//! plumbing (bucket clock, condition cache, dimension extraction, state
//! join, activations, guardrails) lives in `MetricCommon`; family logic
//! lives in the per-family modules.

mod count;
mod duration;
mod gauge;
mod kll;
mod restricted;
mod value;

pub use count::CountMetricProducer;
pub use duration::DurationMetricProducer;
pub use gauge::GaugeMetricProducer;
pub use kll::{KllMetricProducer, KllSketch};
pub use restricted::RestrictedEventProducer;
pub use value::ValueMetricProducer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tally_config::{
    AttributionScope, ConfigKey, DimensionPosition, MetricConfig, UploadThreshold,
};
use tally_event::{DimensionKey, Event, FieldValue, MetricDimensionKey};
use tally_storage::{ActiveActivation, AlertMetadata};

use crate::activation::ActivationSet;
use crate::anomaly::AnomalyTracker;
use crate::bucket::BucketClock;
use crate::condition::ConditionState;
use crate::limits::DIMENSION_HARD_LIMIT;
use crate::report::MetricReport;
use crate::state::STATE_UNKNOWN;
use crate::stats::EngineStats;

/// Projects the configured dimension positions out of an event.
///
/// `AttributionScope::All` positions expand into the Cartesian product
/// over the chain's uids, so one event can produce several keys.
#[derive(Debug, Clone, Default)]
pub struct DimensionExtractor {
    positions: Vec<DimensionPosition>,
}

impl DimensionExtractor {
    pub fn new(positions: Vec<DimensionPosition>) -> Self {
        Self { positions }
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// All dimension keys this event projects to. Unsliced extractors
    /// return the single empty key; absent positions are skipped.
    pub fn extract(&self, event: &Event) -> Vec<DimensionKey> {
        if self.positions.is_empty() {
            return vec![DimensionKey::empty()];
        }
        let mut keys: Vec<Vec<FieldValue>> = vec![Vec::with_capacity(self.positions.len())];
        for position in &self.positions {
            let values: Vec<FieldValue> = match position {
                DimensionPosition::Field(p) => {
                    event.value_at(*p).cloned().into_iter().collect()
                }
                DimensionPosition::AttributionUid(scope) => {
                    let uids = event.attribution_uids();
                    match scope {
                        AttributionScope::First => {
                            uids.first().map(|&u| FieldValue::Int(u)).into_iter().collect()
                        }
                        AttributionScope::Last => {
                            uids.last().map(|&u| FieldValue::Int(u)).into_iter().collect()
                        }
                        AttributionScope::All => {
                            uids.into_iter().map(FieldValue::Int).collect()
                        }
                    }
                }
            };
            match values.len() {
                0 => {}
                1 => {
                    let value = values.into_iter().next().unwrap();
                    for key in &mut keys {
                        key.push(value.clone());
                    }
                }
                _ => {
                    // Cartesian expansion over the repeated values.
                    let mut expanded = Vec::with_capacity(keys.len() * values.len());
                    for key in &keys {
                        for value in &values {
                            let mut next = key.clone();
                            next.push(value.clone());
                            expanded.push(next);
                        }
                    }
                    keys = expanded;
                }
            }
        }
        keys.into_iter().map(DimensionKey::new).collect()
    }
}

/// One metric's joined state atom
#[derive(Debug, Clone)]
pub struct StateLink {
    pub atom_id: i32,
    /// True when the state is tracked per uid; false for global states
    pub keyed_by_uid: bool,
}

/// The plumbing every producer shares
#[derive(Debug)]
pub struct MetricCommon {
    pub metric_id: i64,
    pub config_key: ConfigKey,
    pub bucket: BucketClock,
    pub condition: ConditionState,
    pub condition_index: Option<usize>,
    pub dimensions: DimensionExtractor,
    pub state_links: Vec<StateLink>,
    /// Most recent value per state atom per primary key
    pub state_values: HashMap<i32, HashMap<DimensionKey, FieldValue>>,
    pub threshold: Option<UploadThreshold>,
    pub activations: ActivationSet,
    pub dimension_limit: usize,
    pub dimension_guardrail_hit: bool,
    pub stats: Arc<EngineStats>,
}

impl MetricCommon {
    pub fn new(
        config: &MetricConfig,
        config_key: ConfigKey,
        time_base_ns: i64,
        start_ns: i64,
        condition_index: Option<usize>,
        activations: ActivationSet,
        state_links: Vec<StateLink>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            metric_id: config.id,
            config_key,
            bucket: BucketClock::new(time_base_ns, config.bucket_size_ns, start_ns),
            condition: ConditionState::Unknown,
            condition_index,
            dimensions: DimensionExtractor::new(config.dimensions.clone()),
            state_links,
            state_values: HashMap::new(),
            threshold: config.threshold,
            activations,
            dimension_limit: DIMENSION_HARD_LIMIT,
            dimension_guardrail_hit: false,
            stats,
        }
    }

    /// Whether the linked condition currently allows aggregation
    pub fn condition_met(&self) -> bool {
        self.condition_index.is_none() || self.condition == ConditionState::True
    }

    /// The state projection joined at event time
    pub fn state_key(&self, event: &Event) -> DimensionKey {
        if self.state_links.is_empty() {
            return DimensionKey::empty();
        }
        let values = self
            .state_links
            .iter()
            .map(|link| {
                let primary = if link.keyed_by_uid {
                    DimensionKey::new(vec![FieldValue::Int(event.uid())])
                } else {
                    DimensionKey::empty()
                };
                self.state_values
                    .get(&link.atom_id)
                    .and_then(|values| values.get(&primary))
                    .cloned()
                    .unwrap_or(FieldValue::Int(STATE_UNKNOWN))
            })
            .collect();
        DimensionKey::new(values)
    }

    /// Every metric dimension key this event contributes to
    pub fn metric_keys(&self, event: &Event) -> Vec<MetricDimensionKey> {
        let state = self.state_key(event);
        self.dimensions
            .extract(event)
            .into_iter()
            .map(|what| MetricDimensionKey::new(what, state.clone()))
            .collect()
    }

    /// Record a state transition into the join cache
    pub fn on_state_changed(
        &mut self,
        atom_id: i32,
        primary_key: &DimensionKey,
        new_state: &FieldValue,
    ) {
        if self.state_links.iter().any(|link| link.atom_id == atom_id) {
            self.state_values
                .entry(atom_id)
                .or_default()
                .insert(primary_key.clone(), new_state.clone());
        }
    }

    /// Dimension guardrail: true when `key` may be tracked. New keys past
    /// the limit are refused and the hit is recorded once per report.
    pub fn guardrail_allows<K>(&mut self, tracked: &HashMap<MetricDimensionKey, K>, key: &MetricDimensionKey) -> bool {
        if tracked.contains_key(key) || tracked.len() < self.dimension_limit {
            return true;
        }
        if !self.dimension_guardrail_hit {
            self.dimension_guardrail_hit = true;
            self.stats.note_dimension_guardrail_hit(self.metric_id);
        }
        false
    }

    /// Whether `value` survives the upload threshold
    pub fn passes_threshold(&self, value: i64) -> bool {
        self.threshold.is_none_or(|t| t.passes(value))
    }
}

/// Static dispatch over the producer families
#[derive(Debug)]
pub enum Producer {
    Count(CountMetricProducer),
    Duration(DurationMetricProducer),
    Value(ValueMetricProducer),
    Gauge(GaugeMetricProducer),
    Kll(KllMetricProducer),
}

impl Producer {
    pub fn common(&self) -> &MetricCommon {
        match self {
            Producer::Count(p) => &p.common,
            Producer::Duration(p) => &p.common,
            Producer::Value(p) => &p.common,
            Producer::Gauge(p) => &p.common,
            Producer::Kll(p) => &p.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut MetricCommon {
        match self {
            Producer::Count(p) => &mut p.common,
            Producer::Duration(p) => &mut p.common,
            Producer::Value(p) => &mut p.common,
            Producer::Gauge(p) => &mut p.common,
            Producer::Kll(p) => &mut p.common,
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.common().metric_id
    }

    pub fn family(&self) -> &'static str {
        match self {
            Producer::Count(_) => "count",
            Producer::Duration(_) => "duration",
            Producer::Value(_) => "value",
            Producer::Gauge(_) => "gauge",
            Producer::Kll(_) => "kll",
        }
    }

    pub fn condition_index(&self) -> Option<usize> {
        self.common().condition_index
    }

    /// A matched event for one of this producer's driving matchers
    pub fn on_matched_event(&mut self, matcher_slot: usize, event: &Event) {
        match self {
            Producer::Count(p) => p.on_matched_event(matcher_slot, event),
            Producer::Duration(p) => p.on_matched_event(matcher_slot, event),
            Producer::Value(p) => p.on_matched_event(matcher_slot, event),
            Producer::Gauge(p) => p.on_matched_event(matcher_slot, event),
            Producer::Kll(p) => p.on_matched_event(matcher_slot, event),
        }
    }

    pub fn on_condition_changed(&mut self, condition: ConditionState, event_time_ns: i64) {
        match self {
            Producer::Duration(p) => p.on_condition_changed(condition, event_time_ns),
            Producer::Gauge(p) => p.on_condition_changed(condition, event_time_ns),
            other => other.common_mut().condition = condition,
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        overall: ConditionState,
        changed_to_true: &HashSet<DimensionKey>,
        changed_to_false: &HashSet<DimensionKey>,
        event_time_ns: i64,
    ) {
        match self {
            Producer::Duration(p) => p.on_sliced_condition_may_change(
                overall,
                changed_to_true,
                changed_to_false,
                event_time_ns,
            ),
            other => other.on_condition_changed(overall, event_time_ns),
        }
    }

    pub fn on_state_changed(
        &mut self,
        _event_time_ns: i64,
        atom_id: i32,
        primary_key: &DimensionKey,
        new_state: &FieldValue,
    ) {
        self.common_mut()
            .on_state_changed(atom_id, primary_key, new_state);
    }

    pub fn on_matched_activation(&mut self, matcher_slot: usize, event_time_ns: i64) {
        self.common_mut()
            .activations
            .on_matched(matcher_slot, event_time_ns);
    }

    pub fn is_active(&self, now_ns: i64) -> bool {
        self.common().activations.is_active(now_ns)
    }

    /// Boot complete: open armed activation windows and cut the bucket
    pub fn on_boot_completed(&mut self, now_ns: i64) {
        self.flush_current_bucket(now_ns);
        self.common_mut().activations.on_boot_completed(now_ns);
    }

    /// App upgrade forces a partial bucket
    pub fn notify_app_upgrade(&mut self, now_ns: i64) {
        self.flush_current_bucket(now_ns);
    }

    pub fn flush_if_needed(&mut self, now_ns: i64) {
        match self {
            Producer::Count(p) => p.flush_if_needed(now_ns),
            Producer::Duration(p) => p.flush_if_needed(now_ns),
            Producer::Value(p) => p.flush_if_needed(now_ns),
            Producer::Gauge(p) => p.flush_if_needed(now_ns),
            Producer::Kll(p) => p.flush_if_needed(now_ns),
        }
    }

    pub fn flush_current_bucket(&mut self, now_ns: i64) {
        match self {
            Producer::Count(p) => p.flush_current_bucket(now_ns),
            Producer::Duration(p) => p.flush_current_bucket(now_ns),
            Producer::Value(p) => p.flush_current_bucket(now_ns),
            Producer::Gauge(p) => p.flush_current_bucket(now_ns),
            Producer::Kll(p) => p.flush_current_bucket(now_ns),
        }
    }

    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        include_partial: bool,
        erase: bool,
    ) -> MetricReport {
        match self {
            Producer::Count(p) => p.on_dump_report(dump_time_ns, include_partial, erase),
            Producer::Duration(p) => p.on_dump_report(dump_time_ns, include_partial, erase),
            Producer::Value(p) => p.on_dump_report(dump_time_ns, include_partial, erase),
            Producer::Gauge(p) => p.on_dump_report(dump_time_ns, include_partial, erase),
            Producer::Kll(p) => p.on_dump_report(dump_time_ns, include_partial, erase),
        }
    }

    pub fn drop_data(&mut self, drop_time_ns: i64) {
        match self {
            Producer::Count(p) => p.drop_data(drop_time_ns),
            Producer::Duration(p) => p.drop_data(drop_time_ns),
            Producer::Value(p) => p.drop_data(drop_time_ns),
            Producer::Gauge(p) => p.drop_data(drop_time_ns),
            Producer::Kll(p) => p.drop_data(drop_time_ns),
        }
    }

    pub fn clear_past_buckets(&mut self) {
        match self {
            Producer::Count(p) => p.clear_past_buckets(),
            Producer::Duration(p) => p.clear_past_buckets(),
            Producer::Value(p) => p.clear_past_buckets(),
            Producer::Gauge(p) => p.clear_past_buckets(),
            Producer::Kll(p) => p.clear_past_buckets(),
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Producer::Count(p) => p.byte_size(),
            Producer::Duration(p) => p.byte_size(),
            Producer::Value(p) => p.byte_size(),
            Producer::Gauge(p) => p.byte_size(),
            Producer::Kll(p) => p.byte_size(),
        }
    }

    /// The atom pulled for this producer at pull-alarm ticks, if any
    pub fn pulled_atom_id(&self) -> Option<i32> {
        match self {
            Producer::Gauge(p) => p.pulled_atom_id(),
            _ => None,
        }
    }

    pub fn on_pulled_events(&mut self, ts_ns: i64, events: &[Event]) {
        if let Producer::Gauge(p) = self {
            p.on_pulled_events(ts_ns, events);
        }
    }

    fn anomaly_trackers(&self) -> &[AnomalyTracker] {
        match self {
            Producer::Count(p) => &p.anomaly_trackers,
            Producer::Duration(p) => &p.anomaly_trackers,
            Producer::Value(p) => &p.anomaly_trackers,
            _ => &[],
        }
    }

    fn anomaly_trackers_mut(&mut self) -> &mut [AnomalyTracker] {
        match self {
            Producer::Count(p) => &mut p.anomaly_trackers,
            Producer::Duration(p) => &mut p.anomaly_trackers,
            Producer::Value(p) => &mut p.anomaly_trackers,
            _ => &mut [],
        }
    }

    /// Attach an anomaly tracker; families without anomaly support ignore
    pub fn add_anomaly_tracker(&mut self, tracker: AnomalyTracker) {
        match self {
            Producer::Count(p) => p.anomaly_trackers.push(tracker),
            Producer::Duration(p) => p.anomaly_trackers.push(tracker),
            Producer::Value(p) => p.anomaly_trackers.push(tracker),
            _ => {
                tracing::warn!(
                    metric = tracker.metric_id(),
                    "alert attached to a family without anomaly support"
                );
            }
        }
    }

    pub fn earliest_anomaly_alarm_ns(&self) -> Option<i64> {
        self.anomaly_trackers()
            .iter()
            .filter_map(|t| t.earliest_alarm_ns())
            .min()
    }

    pub fn on_anomaly_alarm_fired(&mut self, now_ns: i64) {
        for tracker in self.anomaly_trackers_mut() {
            tracker.on_alarm_fired(now_ns);
        }
    }

    /// Activation persistence: remaining-TTL records
    pub fn activation_records(&self, now_ns: i64) -> Vec<ActiveActivation> {
        self.common().activations.to_records(now_ns)
    }

    pub fn load_activation_records(&mut self, records: &[ActiveActivation], now_ns: i64) {
        self.common_mut().activations.load_records(records, now_ns);
    }

    /// Anomaly refractory metadata for persistence
    pub fn refractory_metadata(&self, elapsed_to_wall_sec: i64) -> Vec<AlertMetadata> {
        self.anomaly_trackers()
            .iter()
            .filter_map(|t| {
                t.refractory_end_wall_sec(elapsed_to_wall_sec)
                    .map(|sec| AlertMetadata {
                        alert_id: t.alert_id(),
                        refractory_end_wall_sec: sec,
                    })
            })
            .collect()
    }

    pub fn load_refractory_metadata(&mut self, alerts: &[AlertMetadata], wall_to_elapsed_sec: i64) {
        for tracker in self.anomaly_trackers_mut() {
            if let Some(record) = alerts.iter().find(|a| a.alert_id == tracker.alert_id()) {
                tracker.load_refractory_end(record.refractory_end_wall_sec, wall_to_elapsed_sec);
            }
        }
    }
}

#[cfg(test)]
mod duration_test;
#[cfg(test)]
mod gauge_test;
#[cfg(test)]
mod value_test;
