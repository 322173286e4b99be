//! Engine self-statistics
//!
//! Atomic counters for everything the error policy converts into
//! accounting instead of failures. All counters use relaxed ordering;
//! values are eventually consistent, not real-time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Reasons report data may be incomplete, surfaced in every report
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCorruptedReason {
    EventQueueOverflow,
    SocketLoss,
}

/// Process-wide counters; one instance per processor, threaded through
/// constructors rather than accessed as a global
#[derive(Debug, Default)]
pub struct EngineStats {
    atoms_logged: AtomicU64,
    atom_errors: AtomicU64,
    data_dropped: AtomicU64,
    bytes_dropped: AtomicU64,
    broadcasts_sent: AtomicU64,
    broadcast_guardrail_hits: AtomicU64,
    activation_broadcasts_sent: AtomicU64,
    activation_broadcast_guardrail_hits: AtomicU64,
    dimension_guardrail_hits: AtomicU64,
    condition_slice_guardrail_hits: AtomicU64,
    anomalies_declared: AtomicU64,
    configs_added: AtomicU64,
    configs_removed: AtomicU64,
    configs_reset: AtomicU64,
    invalid_configs: AtomicU64,
    reports_sent: AtomicU64,
    active_status_changes: AtomicU64,
    restricted_queries_succeeded: AtomicU64,
    restricted_queries_failed: AtomicU64,
    restricted_store_deletions: AtomicU64,
    storage_failures: AtomicU64,

    event_queue_overflow: AtomicBool,
    socket_loss: AtomicBool,

    /// Per-atom pushed counts, for operator dumps
    atom_counts: Mutex<HashMap<i32, u64>>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_atom_logged(&self, atom_id: i32) {
        self.atoms_logged.fetch_add(1, Ordering::Relaxed);
        *self.atom_counts.lock().entry(atom_id).or_default() += 1;
    }

    pub fn note_atom_error(&self, atom_id: i32) {
        self.atom_errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(atom_id, "dropped malformed event");
    }

    pub fn note_data_dropped(&self, bytes: usize) {
        self.data_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn note_broadcast_sent(&self) {
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_broadcast_guardrail_hit(&self) {
        self.broadcast_guardrail_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_activation_broadcast_sent(&self) {
        self.activation_broadcasts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_activation_broadcast_guardrail_hit(&self, uid: i32) {
        self.activation_broadcast_guardrail_hits
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(uid, "activation broadcast rate limited");
    }

    pub fn note_dimension_guardrail_hit(&self, metric_id: i64) {
        self.dimension_guardrail_hits.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(metric_id, "dimension guardrail hit, new keys ignored");
    }

    pub fn note_condition_slice_guardrail_hit(&self, predicate_id: i64) {
        self.condition_slice_guardrail_hits
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(predicate_id, "condition slice guardrail hit");
    }

    pub fn note_anomaly_declared(&self, alert_id: i64) {
        self.anomalies_declared.fetch_add(1, Ordering::Relaxed);
        tracing::info!(alert_id, "anomaly declared");
    }

    pub fn note_config_added(&self) {
        self.configs_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_config_removed(&self) {
        self.configs_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_config_reset(&self) {
        self.configs_reset.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_invalid_config(&self) {
        self.invalid_configs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_report_sent(&self) {
        self.reports_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_active_status_changed(&self) {
        self.active_status_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_restricted_query_succeeded(&self) {
        self.restricted_queries_succeeded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_restricted_query_failed(&self) {
        self.restricted_queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_restricted_store_deleted(&self) {
        self.restricted_store_deletions
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_storage_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_event_queue_overflow(&self) {
        self.event_queue_overflow.store(true, Ordering::Relaxed);
    }

    pub fn note_socket_loss(&self) {
        self.socket_loss.store(true, Ordering::Relaxed);
    }

    /// The corruption reasons to stamp into reports
    pub fn data_corrupted_reasons(&self) -> Vec<DataCorruptedReason> {
        let mut reasons = Vec::new();
        if self.event_queue_overflow.load(Ordering::Relaxed) {
            reasons.push(DataCorruptedReason::EventQueueOverflow);
        }
        if self.socket_loss.load(Ordering::Relaxed) {
            reasons.push(DataCorruptedReason::SocketLoss);
        }
        reasons
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            atoms_logged: self.atoms_logged.load(Ordering::Relaxed),
            atom_errors: self.atom_errors.load(Ordering::Relaxed),
            data_dropped: self.data_dropped.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
            broadcast_guardrail_hits: self.broadcast_guardrail_hits.load(Ordering::Relaxed),
            activation_broadcasts_sent: self.activation_broadcasts_sent.load(Ordering::Relaxed),
            activation_broadcast_guardrail_hits: self
                .activation_broadcast_guardrail_hits
                .load(Ordering::Relaxed),
            dimension_guardrail_hits: self.dimension_guardrail_hits.load(Ordering::Relaxed),
            condition_slice_guardrail_hits: self
                .condition_slice_guardrail_hits
                .load(Ordering::Relaxed),
            anomalies_declared: self.anomalies_declared.load(Ordering::Relaxed),
            configs_added: self.configs_added.load(Ordering::Relaxed),
            configs_removed: self.configs_removed.load(Ordering::Relaxed),
            configs_reset: self.configs_reset.load(Ordering::Relaxed),
            invalid_configs: self.invalid_configs.load(Ordering::Relaxed),
            reports_sent: self.reports_sent.load(Ordering::Relaxed),
            active_status_changes: self.active_status_changes.load(Ordering::Relaxed),
            restricted_queries_succeeded: self
                .restricted_queries_succeeded
                .load(Ordering::Relaxed),
            restricted_queries_failed: self.restricted_queries_failed.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub atoms_logged: u64,
    pub atom_errors: u64,
    pub data_dropped: u64,
    pub bytes_dropped: u64,
    pub broadcasts_sent: u64,
    pub broadcast_guardrail_hits: u64,
    pub activation_broadcasts_sent: u64,
    pub activation_broadcast_guardrail_hits: u64,
    pub dimension_guardrail_hits: u64,
    pub condition_slice_guardrail_hits: u64,
    pub anomalies_declared: u64,
    pub configs_added: u64,
    pub configs_removed: u64,
    pub configs_reset: u64,
    pub invalid_configs: u64,
    pub reports_sent: u64,
    pub active_status_changes: u64,
    pub restricted_queries_succeeded: u64,
    pub restricted_queries_failed: u64,
    pub storage_failures: u64,
}
