//! Simple condition tracker
//!
//! Driven by up to three matchers: start, stop, stopAll. Sliced trackers
//! keep a nesting counter per output dimension; the overall channel is
//! True iff any slice is True. After each event the tracker exposes the
//! sets of dimensions that flipped, which duration metrics consume.

use std::collections::{HashMap, HashSet};

use tally_config::{InitialValue, SimplePredicate};
use tally_event::{DimensionKey, Event, FieldValue};

use crate::limits::CONDITION_SLICE_HARD_LIMIT;
use crate::stats::EngineStats;

use super::ConditionState;

#[derive(Debug)]
pub struct SimpleConditionTracker {
    predicate_id: i64,
    start_matcher: Option<usize>,
    stop_matcher: Option<usize>,
    stop_all_matcher: Option<usize>,
    count_nesting: bool,
    initial: ConditionState,
    output_dimensions: Vec<usize>,

    /// Nesting count per sliced dimension; absent means stopped
    slice_counts: HashMap<DimensionKey, i32>,

    /// True once any driving matcher has fired; before that the tracker
    /// reports its configured initial value
    known: bool,

    prev_overall: ConditionState,
    changed_to_true: HashSet<DimensionKey>,
    changed_to_false: HashSet<DimensionKey>,

    max_slices: usize,
    guardrail_hit: bool,
}

impl SimpleConditionTracker {
    pub fn new(
        predicate_id: i64,
        start_matcher: Option<usize>,
        stop_matcher: Option<usize>,
        stop_all_matcher: Option<usize>,
        config: &SimplePredicate,
    ) -> Self {
        let initial = match config.initial_value {
            InitialValue::False => ConditionState::False,
            InitialValue::Unknown => ConditionState::Unknown,
        };
        Self {
            predicate_id,
            start_matcher,
            stop_matcher,
            stop_all_matcher,
            count_nesting: config.count_nesting,
            initial,
            output_dimensions: config.output_dimensions.clone(),
            slice_counts: HashMap::new(),
            known: false,
            prev_overall: initial,
            changed_to_true: HashSet::new(),
            changed_to_false: HashSet::new(),
            max_slices: CONDITION_SLICE_HARD_LIMIT,
            guardrail_hit: false,
        }
    }

    pub fn predicate_id(&self) -> i64 {
        self.predicate_id
    }

    pub fn is_sliced(&self) -> bool {
        !self.output_dimensions.is_empty()
    }

    pub fn changed_to_true(&self) -> &HashSet<DimensionKey> {
        &self.changed_to_true
    }

    pub fn changed_to_false(&self) -> &HashSet<DimensionKey> {
        &self.changed_to_false
    }

    /// Overall state: True iff any slice is active
    pub fn current_state(&self) -> ConditionState {
        if self.slice_counts.values().any(|&count| count > 0) {
            ConditionState::True
        } else if self.known {
            ConditionState::False
        } else {
            self.initial
        }
    }

    /// State of one sliced dimension
    pub fn state_for(&self, key: &DimensionKey) -> ConditionState {
        match self.slice_counts.get(key) {
            Some(&count) if count > 0 => ConditionState::True,
            Some(_) => ConditionState::False,
            None if self.known => ConditionState::False,
            None => self.initial,
        }
    }

    fn output_key(&self, event: &Event) -> DimensionKey {
        if self.output_dimensions.is_empty() {
            return DimensionKey::empty();
        }
        let values: Vec<FieldValue> = self
            .output_dimensions
            .iter()
            .filter_map(|&position| event.value_at(position).cloned())
            .collect();
        DimensionKey::new(values)
    }

    pub fn evaluate(
        &mut self,
        event: &Event,
        matched: &[bool],
        stats: &EngineStats,
    ) -> (ConditionState, bool) {
        self.changed_to_true.clear();
        self.changed_to_false.clear();

        let matched_at = |idx: Option<usize>| idx.map(|i| matched.get(i) == Some(&true));

        // stopAll has priority: it collapses every slice.
        if matched_at(self.stop_all_matcher) == Some(true) {
            self.handle_stop_all();
        } else {
            let start = matched_at(self.start_matcher) == Some(true);
            let stop = matched_at(self.stop_matcher) == Some(true);
            if start || stop {
                let key = self.output_key(event);
                // An atom can legitimately drive both edges (e.g. a state
                // change atom); start is applied first.
                if start {
                    self.handle_start(key.clone(), stats);
                }
                if stop {
                    self.handle_stop(&key);
                }
            }
        }

        let state = self.current_state();
        let changed = state != self.prev_overall;
        self.prev_overall = state;
        (state, changed)
    }

    fn handle_start(&mut self, key: DimensionKey, stats: &EngineStats) {
        self.known = true;
        if !self.slice_counts.contains_key(&key) && self.slice_counts.len() >= self.max_slices {
            if !self.guardrail_hit {
                self.guardrail_hit = true;
                stats.note_condition_slice_guardrail_hit(self.predicate_id);
            }
            return;
        }
        let count = self.slice_counts.entry(key.clone()).or_insert(0);
        let was_false = *count == 0;
        if self.count_nesting {
            *count += 1;
        } else {
            *count = 1;
        }
        if was_false {
            self.changed_to_true.insert(key);
        }
    }

    fn handle_stop(&mut self, key: &DimensionKey) {
        self.known = true;
        let Some(count) = self.slice_counts.get_mut(key) else {
            return;
        };
        if *count == 0 {
            return;
        }
        if self.count_nesting {
            *count -= 1;
        } else {
            *count = 0;
        }
        if *count == 0 {
            self.slice_counts.remove(key);
            self.changed_to_false.insert(key.clone());
        }
    }

    fn handle_stop_all(&mut self) {
        self.known = true;
        for (key, count) in self.slice_counts.drain() {
            if count > 0 {
                self.changed_to_false.insert(key);
            }
        }
    }
}
