//! Combination condition tracker

use tally_config::CombinationOp;

use super::ConditionState;

/// And/Or over child trackers, read from the per-event condition cache.
/// Children always occupy earlier cache slots.
#[derive(Debug)]
pub struct CombinationConditionTracker {
    predicate_id: i64,
    op: CombinationOp,
    children: Vec<usize>,
    prev: ConditionState,
}

impl CombinationConditionTracker {
    pub fn new(predicate_id: i64, op: CombinationOp, children: Vec<usize>) -> Self {
        Self {
            predicate_id,
            op,
            children,
            prev: ConditionState::Unknown,
        }
    }

    pub fn predicate_id(&self) -> i64 {
        self.predicate_id
    }

    /// Fold the children's cached states
    pub fn combine(&self, cache: &[ConditionState]) -> ConditionState {
        let states = self.children.iter().map(|&child| cache[child]);
        match self.op {
            CombinationOp::And => {
                let mut result = ConditionState::True;
                for state in states {
                    match state {
                        ConditionState::False => return ConditionState::False,
                        ConditionState::Unknown => result = ConditionState::Unknown,
                        ConditionState::True => {}
                    }
                }
                result
            }
            CombinationOp::Or => {
                let mut result = ConditionState::False;
                for state in states {
                    match state {
                        ConditionState::True => return ConditionState::True,
                        ConditionState::Unknown => result = ConditionState::Unknown,
                        ConditionState::False => {}
                    }
                }
                result
            }
        }
    }

    pub fn evaluate(&mut self, cache: &[ConditionState]) -> (ConditionState, bool) {
        let state = self.combine(cache);
        let changed = state != self.prev;
        self.prev = state;
        (state, changed)
    }
}
