//! Condition trackers
//!
//! A condition is a tri-valued predicate evaluated per event. Simple
//! conditions are state machines driven by start/stop/stop-all matchers,
//! possibly sliced by an output dimension; combinations compose children
//! with And/Or. Trackers are stored in child-before-parent order, so one
//! forward pass per event evaluates everything.

mod combination;
mod simple;

pub use combination::CombinationConditionTracker;
pub use simple::SimpleConditionTracker;

use std::collections::{HashMap, HashSet};

use tally_config::{ConfigError, PredicateConfig, PredicateKind};
use tally_event::{DimensionKey, Event};

use crate::stats::EngineStats;

/// Three-valued condition state. Unknown propagates across composition
/// unless short-circuited by a False (And) or True (Or).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionState {
    False,
    True,
    #[default]
    Unknown,
}

impl ConditionState {
    pub fn is_true(self) -> bool {
        self == ConditionState::True
    }
}

/// One compiled condition tracker
#[derive(Debug)]
pub enum ConditionTracker {
    Simple(SimpleConditionTracker),
    Combination(CombinationConditionTracker),
}

impl ConditionTracker {
    pub fn predicate_id(&self) -> i64 {
        match self {
            ConditionTracker::Simple(t) => t.predicate_id(),
            ConditionTracker::Combination(t) => t.predicate_id(),
        }
    }

    pub fn is_sliced(&self) -> bool {
        matches!(self, ConditionTracker::Simple(t) if t.is_sliced())
    }

    /// Evaluate against one event. `matched` is the per-event matcher
    /// vector; `cache` holds the states of trackers earlier in the
    /// topological order. Returns the new overall state and whether it
    /// changed.
    pub fn evaluate(
        &mut self,
        event: &Event,
        matched: &[bool],
        cache: &[ConditionState],
        stats: &EngineStats,
    ) -> (ConditionState, bool) {
        match self {
            ConditionTracker::Simple(t) => t.evaluate(event, matched, stats),
            ConditionTracker::Combination(t) => t.evaluate(cache),
        }
    }

    /// The state with no event applied, used to seed producer caches
    pub fn initial_state(&self, cache: &[ConditionState]) -> ConditionState {
        match self {
            ConditionTracker::Simple(t) => t.current_state(),
            ConditionTracker::Combination(t) => t.combine(cache),
        }
    }

    /// Dimensions that transitioned to True during the last event
    pub fn changed_to_true(&self) -> &HashSet<DimensionKey> {
        static EMPTY: std::sync::OnceLock<HashSet<DimensionKey>> = std::sync::OnceLock::new();
        match self {
            ConditionTracker::Simple(t) => t.changed_to_true(),
            ConditionTracker::Combination(_) => EMPTY.get_or_init(HashSet::new),
        }
    }

    /// Dimensions that transitioned to False during the last event
    pub fn changed_to_false(&self) -> &HashSet<DimensionKey> {
        static EMPTY: std::sync::OnceLock<HashSet<DimensionKey>> = std::sync::OnceLock::new();
        match self {
            ConditionTracker::Simple(t) => t.changed_to_false(),
            ConditionTracker::Combination(_) => EMPTY.get_or_init(HashSet::new),
        }
    }
}

/// Compile the config's predicates into trackers ordered child-before-
/// parent, with a map from predicate id to tracker slot.
///
/// The returned slot order is the evaluation order; combination children
/// always appear before their parents, so a single forward pass per event
/// is sound. Cycles have been rejected by config validation.
pub fn build_condition_trackers(
    predicates: &[PredicateConfig],
    matcher_index: &crate::matcher::MatcherIndex,
) -> Result<(Vec<ConditionTracker>, HashMap<i64, usize>), ConfigError> {
    // Topological order via DFS from every node.
    let id_to_config: HashMap<i64, usize> = predicates
        .iter()
        .enumerate()
        .map(|(slot, p)| (p.id, slot))
        .collect();

    let mut order: Vec<usize> = Vec::with_capacity(predicates.len());
    let mut visited = vec![false; predicates.len()];
    fn visit(
        slot: usize,
        predicates: &[PredicateConfig],
        id_to_config: &HashMap<i64, usize>,
        visited: &mut [bool],
        order: &mut Vec<usize>,
    ) {
        if visited[slot] {
            return;
        }
        visited[slot] = true;
        if let PredicateKind::Combination(combination) = &predicates[slot].kind {
            for child_id in &combination.children {
                if let Some(&child_slot) = id_to_config.get(child_id) {
                    visit(child_slot, predicates, id_to_config, visited, order);
                }
            }
        }
        order.push(slot);
    }
    for slot in 0..predicates.len() {
        visit(slot, predicates, &id_to_config, &mut visited, &mut order);
    }

    // Slot in the tracker vector for each predicate id.
    let mut slot_by_id: HashMap<i64, usize> = HashMap::with_capacity(order.len());
    for (tracker_slot, &config_slot) in order.iter().enumerate() {
        slot_by_id.insert(predicates[config_slot].id, tracker_slot);
    }

    let mut trackers = Vec::with_capacity(order.len());
    for &config_slot in &order {
        let predicate = &predicates[config_slot];
        let tracker = match &predicate.kind {
            PredicateKind::Simple(simple) => {
                let resolve = |id: Option<i64>| -> Result<Option<usize>, ConfigError> {
                    match id {
                        None => Ok(None),
                        Some(id) => matcher_index.index_of(id).map(Some).ok_or_else(|| {
                            ConfigError::unknown_reference(
                                "predicate",
                                predicate.id,
                                "matcher",
                                id,
                            )
                        }),
                    }
                };
                ConditionTracker::Simple(SimpleConditionTracker::new(
                    predicate.id,
                    resolve(simple.start)?,
                    resolve(simple.stop)?,
                    resolve(simple.stop_all)?,
                    simple,
                ))
            }
            PredicateKind::Combination(combination) => {
                let mut children = Vec::with_capacity(combination.children.len());
                for child_id in &combination.children {
                    let child_slot = *slot_by_id.get(child_id).ok_or_else(|| {
                        ConfigError::unknown_reference(
                            "predicate",
                            predicate.id,
                            "predicate",
                            *child_id,
                        )
                    })?;
                    children.push(child_slot);
                }
                ConditionTracker::Combination(CombinationConditionTracker::new(
                    predicate.id,
                    combination.op,
                    children,
                ))
            }
        };
        trackers.push(tracker);
    }

    Ok((trackers, slot_by_id))
}
