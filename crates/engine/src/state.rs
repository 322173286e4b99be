//! State trackers
//!
//! A state atom announces "the current value of X for primary key Y". One
//! tracker per state atom holds the most recent value per primary key;
//! metrics join those values into their dimension keys at event time.
//!
//! The manager-facing output of one event is at most one `StateChange`,
//! which the processor fans out to every interested manager.

use std::collections::HashMap;

use tally_config::StateAtomConfig;
use tally_event::{DimensionKey, Event, FieldValue};

/// The sentinel reported while a state has never been observed
pub const STATE_UNKNOWN: i32 = -1;

/// A state transition produced by one event
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub atom_id: i32,
    pub primary_key: DimensionKey,
    pub old_state: Option<FieldValue>,
    pub new_state: FieldValue,
}

/// Most recent value per primary key for one state atom
#[derive(Debug)]
struct StateTracker {
    config: StateAtomConfig,
    values: HashMap<DimensionKey, FieldValue>,
}

impl StateTracker {
    fn new(config: StateAtomConfig) -> Self {
        Self {
            config,
            values: HashMap::new(),
        }
    }

    fn primary_key(&self, event: &Event) -> DimensionKey {
        let values: Vec<FieldValue> = self
            .config
            .primary_fields
            .iter()
            .filter_map(|&position| event.value_at(position).cloned())
            .collect();
        DimensionKey::new(values)
    }

    fn on_event(&mut self, event: &Event) -> Option<StateChange> {
        let new_state = event.value_at(self.config.value_field)?.clone();
        let primary_key = self.primary_key(event);
        let old_state = self.values.insert(primary_key.clone(), new_state.clone());
        if old_state.as_ref() == Some(&new_state) {
            return None;
        }
        Some(StateChange {
            atom_id: self.config.atom_id,
            primary_key,
            old_state,
            new_state,
        })
    }
}

/// All state trackers, rebuilt from the union of the active configs
#[derive(Debug, Default)]
pub struct StateManager {
    trackers: HashMap<i32, StateTracker>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the tracker set from every active config's state atoms.
    /// Existing values for atoms that remain are preserved.
    pub fn rebuild<'a>(&mut self, configs: impl Iterator<Item = &'a StateAtomConfig>) {
        let mut trackers = HashMap::new();
        for config in configs {
            let atom_id = config.atom_id;
            if trackers.contains_key(&atom_id) {
                continue;
            }
            let tracker = match self.trackers.remove(&atom_id) {
                Some(existing) => existing,
                None => StateTracker::new(config.clone()),
            };
            trackers.insert(atom_id, tracker);
        }
        self.trackers = trackers;
    }

    pub fn tracked_atom_count(&self) -> usize {
        self.trackers.len()
    }

    /// Feed one event; returns the state change, if the event is a state
    /// atom and the value actually moved
    pub fn on_log_event(&mut self, event: &Event) -> Option<StateChange> {
        self.trackers.get_mut(&event.tag_id())?.on_event(event)
    }

    /// Current value of `atom_id` for `primary_key`
    pub fn value_of(&self, atom_id: i32, primary_key: &DimensionKey) -> Option<&FieldValue> {
        self.trackers.get(&atom_id)?.values.get(primary_key)
    }
}
