//! Atom matchers
//!
//! Matchers are compiled from config into an index-addressed registry; the
//! result of matching one event is a boolean vector of length = number of
//! matchers, computed once and shared by every downstream consumer.
//! Combination matchers reference children by index and are evaluated
//! lazily with memoization; the config validator has already rejected
//! cycles.

use std::collections::HashMap;

use tally_config::{
    ConfigError, FieldPredicate, LogicalOp, MatcherConfig, MatcherKind, PredicateOp,
};
use tally_event::{Event, FieldValue};

/// One compiled matcher
#[derive(Debug, Clone)]
pub enum Matcher {
    Simple {
        id: i64,
        atom_id: i32,
        field_predicates: Vec<FieldPredicate>,
    },
    Combination {
        id: i64,
        op: LogicalOp,
        children: Vec<usize>,
    },
}

impl Matcher {
    pub fn id(&self) -> i64 {
        match self {
            Matcher::Simple { id, .. } | Matcher::Combination { id, .. } => *id,
        }
    }
}

/// The compiled matcher registry of one config
#[derive(Debug, Default)]
pub struct MatcherIndex {
    matchers: Vec<Matcher>,
    index_by_id: HashMap<i64, usize>,
    /// Tag ids any simple matcher is interested in
    tag_interest: HashMap<i32, Vec<usize>>,
}

impl MatcherIndex {
    /// Compile the config's matchers. References have been validated.
    pub fn build(configs: &[MatcherConfig]) -> Result<Self, ConfigError> {
        let mut index_by_id = HashMap::new();
        for (slot, config) in configs.iter().enumerate() {
            index_by_id.insert(config.id, slot);
        }

        let mut matchers = Vec::with_capacity(configs.len());
        let mut tag_interest: HashMap<i32, Vec<usize>> = HashMap::new();
        for (slot, config) in configs.iter().enumerate() {
            match &config.kind {
                MatcherKind::Simple(simple) => {
                    tag_interest.entry(simple.atom_id).or_default().push(slot);
                    matchers.push(Matcher::Simple {
                        id: config.id,
                        atom_id: simple.atom_id,
                        field_predicates: simple.field_predicates.clone(),
                    });
                }
                MatcherKind::Combination(combination) => {
                    let mut children = Vec::with_capacity(combination.children.len());
                    for child_id in &combination.children {
                        let child = *index_by_id.get(child_id).ok_or_else(|| {
                            ConfigError::unknown_reference("matcher", config.id, "matcher", *child_id)
                        })?;
                        children.push(child);
                    }
                    matchers.push(Matcher::Combination {
                        id: config.id,
                        op: combination.op,
                        children,
                    });
                }
            }
        }

        Ok(Self {
            matchers,
            index_by_id,
            tag_interest,
        })
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Registry slot of the matcher with `id`
    pub fn index_of(&self, id: i64) -> Option<usize> {
        self.index_by_id.get(&id).copied()
    }

    /// Whether any simple matcher fires on `atom_id`
    pub fn interested_in(&self, atom_id: i32) -> bool {
        self.tag_interest.contains_key(&atom_id)
    }

    /// All atom ids the registry watches
    pub fn atom_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.tag_interest.keys().copied()
    }

    /// Evaluate every matcher against `event`
    pub fn evaluate(&self, event: &Event) -> Vec<bool> {
        let mut memo: Vec<Option<bool>> = vec![None; self.matchers.len()];
        (0..self.matchers.len())
            .map(|slot| self.evaluate_slot(slot, event, &mut memo))
            .collect()
    }

    fn evaluate_slot(&self, slot: usize, event: &Event, memo: &mut Vec<Option<bool>>) -> bool {
        if let Some(result) = memo[slot] {
            return result;
        }
        let result = match &self.matchers[slot] {
            Matcher::Simple {
                atom_id,
                field_predicates,
                ..
            } => {
                *atom_id == event.tag_id()
                    && field_predicates.iter().all(|p| field_matches(event, p))
            }
            Matcher::Combination { op, children, .. } => {
                let child_results: Vec<bool> = children
                    .iter()
                    .map(|&child| self.evaluate_slot(child, event, memo))
                    .collect();
                match op {
                    LogicalOp::And => child_results.iter().all(|&r| r),
                    LogicalOp::Or => child_results.iter().any(|&r| r),
                    LogicalOp::Not => !child_results[0],
                    LogicalOp::Nand => !child_results.iter().all(|&r| r),
                    LogicalOp::Nor => !child_results.iter().any(|&r| r),
                }
            }
        };
        memo[slot] = Some(result);
        result
    }
}

/// Whether one field predicate holds. A type mismatch means the predicate
/// does not hold, whatever the operator.
fn field_matches(event: &Event, predicate: &FieldPredicate) -> bool {
    let Some(actual) = event.value_at(predicate.position) else {
        return false;
    };
    match predicate.op {
        PredicateOp::Eq => values_equal(actual, &predicate.value),
        PredicateOp::Neq => {
            kinds_comparable(actual, &predicate.value) && !values_equal(actual, &predicate.value)
        }
        PredicateOp::Lt | PredicateOp::Lte | PredicateOp::Gt | PredicateOp::Gte => {
            let (Some(a), Some(b)) = (actual.as_f64(), predicate.value.as_f64()) else {
                return false;
            };
            match predicate.op {
                PredicateOp::Lt => a < b,
                PredicateOp::Lte => a <= b,
                PredicateOp::Gt => a > b,
                PredicateOp::Gte => a >= b,
                _ => unreachable!(),
            }
        }
    }
}

/// Equality with Int/Long numeric interop
fn values_equal(a: &FieldValue, b: &FieldValue) -> bool {
    match (a.as_long(), b.as_long()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn kinds_comparable(a: &FieldValue, b: &FieldValue) -> bool {
    a.kind() == b.kind() || (a.as_long().is_some() && b.as_long().is_some())
}
