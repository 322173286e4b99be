//! Validation tests

use crate::error::ConfigError;
use crate::matchers::{LogicalOp, MatcherCombination, MatcherConfig, MatcherKind, SimpleMatcher};
use crate::metrics::{MetricConfig, MetricKind};
use crate::predicates::{
    CombinationOp, InitialValue, PredicateCombination, PredicateConfig, PredicateKind,
    SimplePredicate,
};
use crate::validation::validate;
use crate::{AlertConfig, TallyConfig};

fn simple_matcher(id: i64, atom_id: i32) -> MatcherConfig {
    MatcherConfig {
        id,
        kind: MatcherKind::Simple(SimpleMatcher {
            atom_id,
            field_predicates: Vec::new(),
        }),
    }
}

fn combination_matcher(id: i64, op: LogicalOp, children: Vec<i64>) -> MatcherConfig {
    MatcherConfig {
        id,
        kind: MatcherKind::Combination(MatcherCombination { op, children }),
    }
}

fn simple_predicate(id: i64, start: i64, stop: i64) -> PredicateConfig {
    PredicateConfig {
        id,
        kind: PredicateKind::Simple(SimplePredicate {
            start: Some(start),
            stop: Some(stop),
            stop_all: None,
            count_nesting: true,
            initial_value: InitialValue::False,
            output_dimensions: Vec::new(),
        }),
    }
}

fn combination_predicate(id: i64, children: Vec<i64>) -> PredicateConfig {
    PredicateConfig {
        id,
        kind: PredicateKind::Combination(PredicateCombination {
            op: CombinationOp::And,
            children,
        }),
    }
}

fn count_metric(id: i64, what: i64) -> MetricConfig {
    MetricConfig {
        id,
        kind: MetricKind::Count { what },
        bucket_size_ns: 10_000,
        condition: None,
        dimensions: Vec::new(),
        state_atoms: Vec::new(),
        threshold: None,
        activations: Vec::new(),
    }
}

#[test]
fn test_valid_config() {
    let config = TallyConfig {
        matchers: vec![
            simple_matcher(1, 100),
            simple_matcher(2, 200),
            combination_matcher(3, LogicalOp::Or, vec![1, 2]),
        ],
        predicates: vec![simple_predicate(10, 1, 2)],
        metrics: vec![{
            let mut m = count_metric(20, 3);
            m.condition = Some(10);
            m
        }],
        ..Default::default()
    };
    validate(&config).unwrap();
}

#[test]
fn test_duplicate_matcher_id_rejected() {
    let config = TallyConfig {
        matchers: vec![simple_matcher(1, 100), simple_matcher(1, 200)],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::DuplicateId {
            element: "matcher",
            id: 1
        })
    ));
}

#[test]
fn test_unknown_matcher_reference_rejected() {
    let config = TallyConfig {
        matchers: vec![simple_matcher(1, 100)],
        metrics: vec![count_metric(20, 99)],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::UnknownReference { id: 99, .. })
    ));
}

#[test]
fn test_matcher_cycle_rejected() {
    // 1 -> 2 -> 3 -> 1
    let config = TallyConfig {
        matchers: vec![
            combination_matcher(1, LogicalOp::And, vec![2]),
            combination_matcher(2, LogicalOp::And, vec![3]),
            combination_matcher(3, LogicalOp::Not, vec![1]),
        ],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::CycleDetected {
            element: "matcher",
            ..
        })
    ));
}

#[test]
fn test_matcher_self_cycle_rejected() {
    let config = TallyConfig {
        matchers: vec![combination_matcher(1, LogicalOp::Not, vec![1])],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::CycleDetected { .. })
    ));
}

#[test]
fn test_diamond_is_not_a_cycle() {
    // 4 -> {2, 3}, both -> 1: shared child, no cycle.
    let config = TallyConfig {
        matchers: vec![
            simple_matcher(1, 100),
            combination_matcher(2, LogicalOp::Not, vec![1]),
            combination_matcher(3, LogicalOp::And, vec![1]),
            combination_matcher(4, LogicalOp::Or, vec![2, 3]),
        ],
        ..Default::default()
    };
    validate(&config).unwrap();
}

#[test]
fn test_predicate_cycle_rejected() {
    let config = TallyConfig {
        matchers: vec![simple_matcher(1, 100), simple_matcher(2, 200)],
        predicates: vec![
            combination_predicate(10, vec![11]),
            combination_predicate(11, vec![10]),
        ],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::CycleDetected {
            element: "predicate",
            ..
        })
    ));
}

#[test]
fn test_empty_combination_rejected() {
    let config = TallyConfig {
        matchers: vec![combination_matcher(1, LogicalOp::And, Vec::new())],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::EmptyCombination { .. })
    ));
}

#[test]
fn test_duration_what_must_be_simple_predicate() {
    let config = TallyConfig {
        matchers: vec![simple_matcher(1, 100), simple_matcher(2, 200)],
        predicates: vec![
            simple_predicate(10, 1, 2),
            combination_predicate(11, vec![10]),
        ],
        metrics: vec![MetricConfig {
            id: 20,
            kind: MetricKind::Duration {
                what: 11,
                aggregation: Default::default(),
            },
            bucket_size_ns: 10_000,
            condition: None,
            dimensions: Vec::new(),
            state_atoms: Vec::new(),
            threshold: None,
            activations: Vec::new(),
        }],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::InvalidValue { field: "what", .. })
    ));
}

#[test]
fn test_alert_requires_existing_metric() {
    let config = TallyConfig {
        matchers: vec![simple_matcher(1, 100)],
        metrics: vec![count_metric(20, 1)],
        alerts: vec![AlertConfig {
            id: 30,
            metric_id: 999,
            num_buckets: 1,
            trigger_if_sum_gt: 10,
            refractory_period_secs: 0,
        }],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::UnknownReference { id: 999, .. })
    ));
}

#[test]
fn test_nonpositive_bucket_rejected() {
    let mut metric = count_metric(20, 1);
    metric.bucket_size_ns = 0;
    let config = TallyConfig {
        matchers: vec![simple_matcher(1, 100)],
        metrics: vec![metric],
        ..Default::default()
    };
    assert!(matches!(
        validate(&config),
        Err(ConfigError::InvalidValue {
            field: "bucket_size_ns",
            ..
        })
    ));
}
