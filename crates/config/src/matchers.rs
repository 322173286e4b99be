//! Atom matcher configuration
//!
//! A matcher is a predicate over a single incoming event: either a simple
//! matcher (tag id plus optional field-value comparisons) or a logical
//! combination of other matchers referenced by id.

use serde::{Deserialize, Serialize};
use tally_event::FieldValue;

/// One atom matcher, addressable by id from predicates and metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub id: i64,
    #[serde(flatten)]
    pub kind: MatcherKind,
}

/// Simple or combination matcher body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Simple(SimpleMatcher),
    Combination(MatcherCombination),
}

/// Matches a tag id, optionally narrowed by field comparisons
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleMatcher {
    /// The atom tag id this matcher fires on
    pub atom_id: i32,

    /// All predicates must hold for the matcher to fire
    #[serde(default)]
    pub field_predicates: Vec<FieldPredicate>,
}

/// One comparison between an event field and a literal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPredicate {
    /// 1-based field position
    pub position: usize,
    pub op: PredicateOp,
    pub value: FieldValue,
}

/// Comparison operator. Ordering operators apply to numeric fields only;
/// a type mismatch means the predicate does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Logical combination over other matchers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherCombination {
    pub op: LogicalOp,
    /// Child matcher ids
    pub children: Vec<i64>,
}

/// Operators accepted in matcher combinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
    Not,
    Nand,
    Nor,
}
