//! Condition predicate configuration
//!
//! A predicate describes a tri-valued condition evaluated per event. Simple
//! predicates are driven by start/stop/stop-all matchers and may be sliced
//! by an output dimension; combinations compose child predicates with
//! And/Or.

use serde::{Deserialize, Serialize};

/// One predicate, addressable by id from metrics and other predicates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateConfig {
    pub id: i64,
    #[serde(flatten)]
    pub kind: PredicateKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateKind {
    Simple(SimplePredicate),
    Combination(PredicateCombination),
}

/// A start/stop driven condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimplePredicate {
    /// Matcher id that turns the condition true
    pub start: Option<i64>,

    /// Matcher id that turns the condition false
    pub stop: Option<i64>,

    /// Matcher id that collapses every sliced dimension to false
    pub stop_all: Option<i64>,

    /// When true, repeated starts nest and require as many stops
    #[serde(default = "default_true")]
    pub count_nesting: bool,

    /// The value before any driving matcher has fired
    #[serde(default)]
    pub initial_value: InitialValue,

    /// 1-based field positions of the start event projected as the output
    /// dimension; empty means the condition is unsliced
    #[serde(default)]
    pub output_dimensions: Vec<usize>,
}

fn default_true() -> bool {
    true
}

/// Initial condition value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialValue {
    #[default]
    False,
    Unknown,
}

/// And/Or over child predicate ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateCombination {
    pub op: CombinationOp,
    pub children: Vec<i64>,
}

/// Operators accepted in predicate combinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationOp {
    And,
    Or,
}
