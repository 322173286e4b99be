//! Restricted-store seam tests

use tally_config::ConfigKey;
use tally_event::FieldValue;

use crate::restricted::{MemoryRestrictedStore, RestrictedStore, StoredEventRow};

fn row(atom_id: i32, elapsed_ns: i64, wall_clock_ns: i64) -> StoredEventRow {
    StoredEventRow {
        atom_id,
        elapsed_ns,
        wall_clock_ns,
        fields: vec![FieldValue::Int(1)],
    }
}

#[test]
fn test_flush_and_query() {
    let mut store = MemoryRestrictedStore::new(3);
    let key = ConfigKey::new(1000, 1);

    store
        .flush_events(&key, 5, &[row(100, 10, 1_000), row(100, 20, 2_000)])
        .unwrap();
    assert_eq!(store.row_count(&key, 5), 2);

    let result = store.query(&key, "select * from metric_5").unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.column_names.len(), result.column_types.len());
    for r in &result.rows {
        assert_eq!(r.len(), result.column_names.len());
    }
}

#[test]
fn test_delete_config_clears_tables() {
    let mut store = MemoryRestrictedStore::new(3);
    let key = ConfigKey::new(1000, 1);
    let other = ConfigKey::new(2000, 1);

    store.flush_events(&key, 5, &[row(100, 10, 1_000)]).unwrap();
    store.flush_events(&other, 5, &[row(100, 10, 1_000)]).unwrap();
    store.ensure_device_table(&key).unwrap();

    store.delete_config(&key).unwrap();
    assert_eq!(store.row_count(&key, 5), 0);
    assert!(!store.has_device_table(&key));
    assert_eq!(store.row_count(&other, 5), 1);
}

#[test]
fn test_ttl_drops_old_rows() {
    let mut store = MemoryRestrictedStore::new(3);
    let key = ConfigKey::new(1000, 1);
    store
        .flush_events(&key, 5, &[row(100, 10, 1_000), row(100, 20, 9_000)])
        .unwrap();

    store.enforce_ttl(&key, 5, 5_000).unwrap();
    assert_eq!(store.row_count(&key, 5), 1);
}

#[test]
fn test_failure_injection() {
    let mut store = MemoryRestrictedStore::new(3);
    store.fail_with("disk full");
    let key = ConfigKey::new(1000, 1);
    assert!(store.flush_events(&key, 5, &[row(1, 1, 1)]).is_err());
    assert!(store.query(&key, "select 1").is_err());
}
