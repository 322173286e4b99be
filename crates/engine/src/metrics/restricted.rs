//! Restricted event buffer
//!
//! Restricted configs never build report buffers; matched events buffer
//! here briefly and flush into the external SQL store. Dump reports are
//! an error for this producer and return nothing.

use tally_config::ConfigKey;
use tally_event::Event;
use tally_storage::{RestrictedStore, StoredEventRow};

use crate::condition::ConditionState;
use crate::limits::{DEFAULT_RESTRICTED_DATA_TTL_DAYS, NS_PER_DAY};

#[derive(Debug)]
pub struct RestrictedEventProducer {
    config_key: ConfigKey,
    metric_id: i64,
    what_matcher: usize,
    condition_index: Option<usize>,
    condition: ConditionState,
    ttl_days: u32,

    events: Vec<StoredEventRow>,
    buffered_bytes: usize,
}

impl RestrictedEventProducer {
    pub fn new(
        config_key: ConfigKey,
        metric_id: i64,
        what_matcher: usize,
        condition_index: Option<usize>,
        ttl_days: Option<u32>,
    ) -> Self {
        Self {
            config_key,
            metric_id,
            what_matcher,
            condition_index,
            condition: ConditionState::Unknown,
            ttl_days: ttl_days.unwrap_or(DEFAULT_RESTRICTED_DATA_TTL_DAYS),
            events: Vec::new(),
            buffered_bytes: 0,
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.metric_id
    }

    pub fn condition_index(&self) -> Option<usize> {
        self.condition_index
    }

    pub fn on_condition_changed(&mut self, condition: ConditionState) {
        self.condition = condition;
    }

    fn condition_met(&self) -> bool {
        self.condition_index.is_none() || self.condition == ConditionState::True
    }

    pub fn on_matched_event(&mut self, matcher_slot: usize, event: &Event) {
        if matcher_slot != self.what_matcher || !self.condition_met() {
            return;
        }
        let row = StoredEventRow {
            atom_id: event.tag_id(),
            elapsed_ns: event.elapsed_timestamp_ns(),
            wall_clock_ns: event.wall_clock_ns().unwrap_or(0),
            fields: event.values().to_vec(),
        };
        self.buffered_bytes += std::mem::size_of::<StoredEventRow>()
            + row.fields.len() * std::mem::size_of::<tally_event::FieldValue>();
        self.events.push(row);
    }

    /// Drain buffered rows into the store
    pub fn flush(&mut self, store: &mut dyn RestrictedStore) {
        if self.events.is_empty() {
            return;
        }
        if let Err(e) = store.flush_events(&self.config_key, self.metric_id, &self.events) {
            tracing::warn!(
                config = %self.config_key,
                metric = self.metric_id,
                error = %e,
                "restricted flush failed, rows dropped"
            );
        }
        self.events.clear();
        self.buffered_bytes = 0;
    }

    /// Expire stored rows past the configured TTL
    pub fn enforce_ttl(&self, store: &mut dyn RestrictedStore, wall_clock_ns: i64) {
        let expiry = wall_clock_ns - i64::from(self.ttl_days) * NS_PER_DAY;
        if let Err(e) = store.enforce_ttl(&self.config_key, self.metric_id, expiry) {
            tracing::warn!(
                config = %self.config_key,
                metric = self.metric_id,
                error = %e,
                "restricted ttl enforcement failed"
            );
        }
    }

    pub fn drop_data(&mut self) {
        self.events.clear();
        self.buffered_bytes = 0;
    }

    pub fn byte_size(&self) -> usize {
        self.buffered_bytes
    }
}
