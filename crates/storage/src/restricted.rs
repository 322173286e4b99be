//! Restricted-store seam
//!
//! Restricted metrics never buffer reports in memory for upload; their data
//! path is an external per-config SQL store. The engine drives that store
//! through this narrow trait and never sees its byte layout.

use std::collections::HashMap;

use tally_config::ConfigKey;
use tally_event::FieldValue;

use crate::error::{Result, StorageError};

/// One event row handed to the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEventRow {
    pub atom_id: i32,
    pub elapsed_ns: i64,
    pub wall_clock_ns: i64,
    pub fields: Vec<FieldValue>,
}

/// A query result: row-major string cells plus column metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub rows: Vec<Vec<String>>,
    pub column_names: Vec<String>,
    pub column_types: Vec<i32>,
}

/// The narrow interface of the external restricted SQL store
pub trait RestrictedStore: Send {
    /// Schema version, compared against the client's minimum
    fn version(&self) -> i32;

    /// Create or refresh the per-config device-info table
    fn ensure_device_table(&mut self, key: &ConfigKey) -> Result<()>;

    /// Append event rows to the metric's table
    fn flush_events(
        &mut self,
        key: &ConfigKey,
        metric_id: i64,
        rows: &[StoredEventRow],
    ) -> Result<()>;

    /// Execute `sql` over the config's store
    fn query(&mut self, key: &ConfigKey, sql: &str) -> Result<QueryRows>;

    /// Drop every table of the config
    fn delete_config(&mut self, key: &ConfigKey) -> Result<()>;

    /// Delete rows older than `expiry_wall_ns` from the metric's table
    fn enforce_ttl(&mut self, key: &ConfigKey, metric_id: i64, expiry_wall_ns: i64) -> Result<()>;

    /// Bound total store size; oversized configs lose their data
    fn enforce_guardrails(&mut self, max_bytes: usize) -> Result<()>;
}

/// In-memory stand-in used by tests and by hosts without a SQL backend.
///
/// `query` ignores the SQL text and returns every row of the config in
/// insertion order, which is enough to exercise the engine's authorization
/// ladder and row-shape checks.
#[derive(Debug, Default)]
pub struct MemoryRestrictedStore {
    version: i32,
    tables: HashMap<(ConfigKey, i64), Vec<StoredEventRow>>,
    device_tables: Vec<ConfigKey>,
    /// When set, every operation fails with this message
    fail_with: Option<String>,
}

impl MemoryRestrictedStore {
    pub fn new(version: i32) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    /// Make every subsequent operation fail (for error-path tests)
    pub fn fail_with(&mut self, message: impl Into<String>) {
        self.fail_with = Some(message.into());
    }

    pub fn row_count(&self, key: &ConfigKey, metric_id: i64) -> usize {
        self.tables
            .get(&(*key, metric_id))
            .map_or(0, |rows| rows.len())
    }

    pub fn has_device_table(&self, key: &ConfigKey) -> bool {
        self.device_tables.contains(key)
    }

    fn check_failure(&self) -> Result<()> {
        match &self.fail_with {
            Some(message) => Err(StorageError::store(message.clone())),
            None => Ok(()),
        }
    }
}

impl RestrictedStore for MemoryRestrictedStore {
    fn version(&self) -> i32 {
        self.version
    }

    fn ensure_device_table(&mut self, key: &ConfigKey) -> Result<()> {
        self.check_failure()?;
        if !self.device_tables.contains(key) {
            self.device_tables.push(*key);
        }
        Ok(())
    }

    fn flush_events(
        &mut self,
        key: &ConfigKey,
        metric_id: i64,
        rows: &[StoredEventRow],
    ) -> Result<()> {
        self.check_failure()?;
        self.tables
            .entry((*key, metric_id))
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }

    fn query(&mut self, key: &ConfigKey, _sql: &str) -> Result<QueryRows> {
        self.check_failure()?;
        let mut result = QueryRows {
            column_names: vec![
                "atomId".to_string(),
                "elapsedTimestampNs".to_string(),
                "wallTimestampNs".to_string(),
            ],
            column_types: vec![1, 1, 1],
            rows: Vec::new(),
        };
        for ((row_key, _), rows) in &self.tables {
            if row_key != key {
                continue;
            }
            for row in rows {
                result.rows.push(vec![
                    row.atom_id.to_string(),
                    row.elapsed_ns.to_string(),
                    row.wall_clock_ns.to_string(),
                ]);
            }
        }
        Ok(result)
    }

    fn delete_config(&mut self, key: &ConfigKey) -> Result<()> {
        self.check_failure()?;
        self.tables.retain(|(row_key, _), _| row_key != key);
        self.device_tables.retain(|k| k != key);
        Ok(())
    }

    fn enforce_ttl(&mut self, key: &ConfigKey, metric_id: i64, expiry_wall_ns: i64) -> Result<()> {
        self.check_failure()?;
        if let Some(rows) = self.tables.get_mut(&(*key, metric_id)) {
            rows.retain(|row| row.wall_clock_ns >= expiry_wall_ns);
        }
        Ok(())
    }

    fn enforce_guardrails(&mut self, max_bytes: usize) -> Result<()> {
        self.check_failure()?;
        // Rough accounting: one row ~ its field payload.
        let approx = |rows: &Vec<StoredEventRow>| -> usize {
            rows.len() * std::mem::size_of::<StoredEventRow>()
        };
        let keys: Vec<ConfigKey> = self.tables.keys().map(|(k, _)| *k).collect();
        for key in keys {
            let total: usize = self
                .tables
                .iter()
                .filter(|((k, _), _)| *k == key)
                .map(|(_, rows)| approx(rows))
                .sum();
            if total > max_bytes {
                tracing::warn!(config = %key, total, "restricted store over guardrail, clearing");
                self.tables.retain(|(k, _), _| *k != key);
            }
        }
        Ok(())
    }
}
