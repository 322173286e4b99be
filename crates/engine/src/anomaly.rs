//! Anomaly detection and alarms
//!
//! Each anomaly tracker watches one alert: a rolling sum over the last
//! `num_buckets` bucket values per dimension, compared against a
//! threshold. Count-style metrics declare on breach immediately; duration
//! metrics schedule an alarm at the predicted crossing time and declare
//! when it fires. A refractory period keeps a declared dimension quiet.
//!
//! At most one alarm is scheduled per dimension; cancelling is idempotent.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tally_config::{AlertConfig, ConfigKey};
use tally_event::MetricDimensionKey;

use crate::limits::NS_PER_SEC;
use crate::stats::EngineStats;

#[derive(Debug)]
pub struct AnomalyTracker {
    alert: AlertConfig,
    config_key: ConfigKey,

    /// Ring of past full-bucket values, newest last; spans at most
    /// `num_buckets - 1` buckets (the current bucket value arrives with
    /// the detection call)
    past: VecDeque<(i64, HashMap<MetricDimensionKey, i64>)>,

    /// Wall seconds until which each dimension stays quiet
    refractory_until_sec: HashMap<MetricDimensionKey, i64>,

    /// Floor applied to every dimension, restored from metadata
    global_refractory_until_sec: i64,

    /// Predicted-crossing alarms, elapsed ns
    alarms: HashMap<MetricDimensionKey, i64>,

    stats: Arc<EngineStats>,
}

impl AnomalyTracker {
    pub fn new(alert: AlertConfig, config_key: ConfigKey, stats: Arc<EngineStats>) -> Self {
        Self {
            alert,
            config_key,
            past: VecDeque::new(),
            refractory_until_sec: HashMap::new(),
            global_refractory_until_sec: 0,
            alarms: HashMap::new(),
            stats,
        }
    }

    pub fn alert_id(&self) -> i64 {
        self.alert.id
    }

    pub fn metric_id(&self) -> i64 {
        self.alert.metric_id
    }

    pub fn threshold(&self) -> i64 {
        self.alert.trigger_if_sum_gt
    }

    /// Record a finished full bucket's value for `key`
    pub fn add_past_bucket(&mut self, key: &MetricDimensionKey, value: i64, bucket_num: i64) {
        if self.alert.num_buckets <= 1 {
            // Rolling sum is just the current bucket; no history needed.
            return;
        }
        let oldest_kept = bucket_num - (self.alert.num_buckets as i64 - 1) + 1;
        while let Some((num, _)) = self.past.front() {
            if *num < oldest_kept {
                self.past.pop_front();
            } else {
                break;
            }
        }
        match self.past.back_mut() {
            Some((num, values)) if *num == bucket_num => {
                *values.entry(key.clone()).or_insert(0) += value;
            }
            _ => {
                let mut values = HashMap::new();
                values.insert(key.clone(), value);
                self.past.push_back((bucket_num, values));
            }
        }
    }

    /// Sum of the retained past buckets for `key`, relative to the bucket
    /// that will hold `current_bucket_num`
    pub fn past_sum(&self, key: &MetricDimensionKey, current_bucket_num: i64) -> i64 {
        let oldest = current_bucket_num - (self.alert.num_buckets as i64 - 1);
        self.past
            .iter()
            .filter(|(num, _)| *num >= oldest && *num < current_bucket_num)
            .filter_map(|(_, values)| values.get(key))
            .sum()
    }

    fn rolling_sum(&self, key: &MetricDimensionKey, current_bucket_num: i64, current: i64) -> i64 {
        self.past_sum(key, current_bucket_num) + current
    }

    fn in_refractory(&self, key: &MetricDimensionKey, now_sec: i64) -> bool {
        if now_sec < self.global_refractory_until_sec {
            return true;
        }
        self.refractory_until_sec
            .get(key)
            .is_some_and(|&until| now_sec < until)
    }

    /// Immediate detection path (count, value): declare when the rolling
    /// sum including `current_value` exceeds the threshold. Returns
    /// whether an anomaly was declared.
    pub fn detect_and_declare(
        &mut self,
        now_ns: i64,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        current_value: i64,
    ) -> bool {
        if self.rolling_sum(key, current_bucket_num, current_value) <= self.alert.trigger_if_sum_gt
        {
            return false;
        }
        self.declare(now_ns, key)
    }

    fn declare(&mut self, now_ns: i64, key: &MetricDimensionKey) -> bool {
        let now_sec = now_ns / NS_PER_SEC;
        if self.in_refractory(key, now_sec) {
            return false;
        }
        self.refractory_until_sec.insert(
            key.clone(),
            now_sec + i64::from(self.alert.refractory_period_secs) + 1,
        );
        self.stats.note_anomaly_declared(self.alert.id);
        tracing::info!(
            config = %self.config_key,
            alert = self.alert.id,
            metric = self.alert.metric_id,
            dimension = %key,
            "anomaly detected"
        );
        true
    }

    // ------------------------------------------------------------------
    // Predicted-crossing alarms (duration path)
    // ------------------------------------------------------------------

    /// Schedule (or move) the alarm for `key`
    pub fn start_alarm(&mut self, key: &MetricDimensionKey, alarm_ns: i64) {
        if alarm_ns <= 0 {
            return;
        }
        self.alarms.insert(key.clone(), alarm_ns);
    }

    /// Cancel the alarm for `key`; if it should already have fired,
    /// declare now. Idempotent.
    pub fn stop_alarm(&mut self, key: &MetricDimensionKey, now_ns: i64) {
        if let Some(alarm_ns) = self.alarms.remove(key)
            && alarm_ns <= now_ns
        {
            self.declare(now_ns, key);
        }
    }

    /// Earliest scheduled alarm, if any
    pub fn earliest_alarm_ns(&self) -> Option<i64> {
        self.alarms.values().copied().min()
    }

    /// Fire every alarm at or before `now_ns`
    pub fn on_alarm_fired(&mut self, now_ns: i64) {
        let due: Vec<MetricDimensionKey> = self
            .alarms
            .iter()
            .filter(|&(_, &alarm_ns)| alarm_ns <= now_ns)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.alarms.remove(&key);
            self.declare(now_ns, &key);
        }
    }

    /// Drop every scheduled alarm
    pub fn cancel_all_alarms(&mut self) {
        self.alarms.clear();
    }

    // ------------------------------------------------------------------
    // Metadata round-trip
    // ------------------------------------------------------------------

    /// Latest refractory end in wall seconds, for metadata persistence.
    /// `elapsed_to_wall` converts this tracker's elapsed-anchored seconds.
    pub fn refractory_end_wall_sec(&self, elapsed_to_wall_sec: i64) -> Option<i64> {
        self.refractory_until_sec
            .values()
            .copied()
            .max()
            .map(|sec| sec + elapsed_to_wall_sec)
            .filter(|&sec| sec > 0)
    }

    /// Restore a persisted refractory end as a global floor
    pub fn load_refractory_end(&mut self, wall_sec: i64, wall_to_elapsed_sec: i64) {
        self.global_refractory_until_sec = wall_sec + wall_to_elapsed_sec;
    }
}

/// Periodic-alarm queue: (fire second, alarm id) pairs popped when the
/// clock passes them
#[derive(Debug, Default)]
pub struct AlarmMonitor {
    alarms: std::collections::BTreeSet<(i64, i64)>,
}

impl AlarmMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_alarm(&mut self, fire_sec: i64, alarm_id: i64) {
        self.alarms.insert((fire_sec, alarm_id));
    }

    pub fn cancel_alarm(&mut self, alarm_id: i64) {
        self.alarms.retain(|&(_, id)| id != alarm_id);
    }

    /// Remove and return every alarm due at or before `sec`
    pub fn pop_sooner_than(&mut self, sec: i64) -> Vec<i64> {
        let due: Vec<(i64, i64)> = self
            .alarms
            .iter()
            .take_while(|&&(fire_sec, _)| fire_sec <= sec)
            .copied()
            .collect();
        for alarm in &due {
            self.alarms.remove(alarm);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn earliest_sec(&self) -> Option<i64> {
        self.alarms.iter().next().map(|&(sec, _)| sec)
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }
}
