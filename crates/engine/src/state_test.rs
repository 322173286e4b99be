//! State tracker tests

use tally_config::StateAtomConfig;
use tally_event::{DimensionKey, Event, FieldValue};

use crate::state::StateManager;

const SCREEN_STATE: i32 = 29;
const UID_PROCESS_STATE: i32 = 27;

fn configs() -> Vec<StateAtomConfig> {
    vec![
        // Global state: one slot for the whole device.
        StateAtomConfig {
            atom_id: SCREEN_STATE,
            primary_fields: Vec::new(),
            value_field: 1,
        },
        // Per-uid state: primary key is the uid field.
        StateAtomConfig {
            atom_id: UID_PROCESS_STATE,
            primary_fields: vec![1],
            value_field: 2,
        },
    ]
}

fn manager() -> StateManager {
    let configs = configs();
    let mut manager = StateManager::new();
    manager.rebuild(configs.iter());
    manager
}

#[test]
fn test_non_state_atom_ignored() {
    let mut manager = manager();
    assert!(manager
        .on_log_event(&Event::new(999, 1).with_field(FieldValue::Int(2)))
        .is_none());
}

#[test]
fn test_global_state_transition() {
    let mut manager = manager();
    let change = manager
        .on_log_event(&Event::new(SCREEN_STATE, 1).with_field(FieldValue::Int(2)))
        .unwrap();
    assert_eq!(change.atom_id, SCREEN_STATE);
    assert!(change.primary_key.is_empty());
    assert!(change.old_state.is_none());
    assert_eq!(change.new_state, FieldValue::Int(2));

    // Same value again: no transition.
    assert!(manager
        .on_log_event(&Event::new(SCREEN_STATE, 2).with_field(FieldValue::Int(2)))
        .is_none());

    let change = manager
        .on_log_event(&Event::new(SCREEN_STATE, 3).with_field(FieldValue::Int(1)))
        .unwrap();
    assert_eq!(change.old_state, Some(FieldValue::Int(2)));
}

#[test]
fn test_per_uid_state_is_isolated() {
    let mut manager = manager();
    let event = |uid: i32, state: i32, ts: i64| {
        Event::new(UID_PROCESS_STATE, ts)
            .with_field(FieldValue::Int(uid))
            .with_field(FieldValue::Int(state))
    };

    manager.on_log_event(&event(1000, 5, 1)).unwrap();
    manager.on_log_event(&event(2000, 7, 2)).unwrap();

    let key_1000 = DimensionKey::new(vec![FieldValue::Int(1000)]);
    let key_2000 = DimensionKey::new(vec![FieldValue::Int(2000)]);
    assert_eq!(
        manager.value_of(UID_PROCESS_STATE, &key_1000),
        Some(&FieldValue::Int(5))
    );
    assert_eq!(
        manager.value_of(UID_PROCESS_STATE, &key_2000),
        Some(&FieldValue::Int(7))
    );
}

#[test]
fn test_rebuild_preserves_surviving_trackers() {
    let mut manager = manager();
    manager
        .on_log_event(&Event::new(SCREEN_STATE, 1).with_field(FieldValue::Int(2)))
        .unwrap();

    // Rebuild with only the screen state: value survives.
    let keep = vec![configs()[0].clone()];
    manager.rebuild(keep.iter());
    assert_eq!(manager.tracked_atom_count(), 1);
    assert_eq!(
        manager.value_of(SCREEN_STATE, &DimensionKey::empty()),
        Some(&FieldValue::Int(2))
    );

    // The dropped tracker is gone.
    assert!(manager
        .on_log_event(
            &Event::new(UID_PROCESS_STATE, 5)
                .with_field(FieldValue::Int(1000))
                .with_field(FieldValue::Int(5))
        )
        .is_none());
}
