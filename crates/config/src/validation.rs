//! Configuration validation
//!
//! Validates config consistency before the engine builds trackers:
//! - every id referenced by a combination, metric, alert or activation
//!   exists
//! - no duplicate ids within an element family
//! - combination matchers and predicates are acyclic (depth-first search
//!   with gray/black marking)
//! - family-specific field constraints (positive bucket sizes, simple
//!   what-predicates for durations, positive value-field positions)

use std::collections::HashMap;

use crate::error::{ConfigError, Result};
use crate::matchers::MatcherKind;
use crate::metrics::MetricKind;
use crate::predicates::PredicateKind;
use crate::TallyConfig;

/// Validate the entire configuration
pub fn validate(config: &TallyConfig) -> Result<()> {
    let matchers = index_ids("matcher", config.matchers.iter().map(|m| m.id))?;
    let predicates = index_ids("predicate", config.predicates.iter().map(|p| p.id))?;
    let metrics = index_ids("metric", config.metrics.iter().map(|m| m.id))?;
    index_ids("alert", config.alerts.iter().map(|a| a.id))?;
    index_ids("alarm", config.alarms.iter().map(|a| a.id))?;

    validate_matchers(config, &matchers)?;
    validate_predicates(config, &matchers, &predicates)?;
    validate_metrics(config, &matchers, &predicates)?;
    validate_alerts(config, &metrics)?;
    Ok(())
}

/// Build an id -> slot index map, rejecting duplicates
fn index_ids(
    element: &'static str,
    ids: impl Iterator<Item = i64>,
) -> Result<HashMap<i64, usize>> {
    let mut map = HashMap::new();
    for (slot, id) in ids.enumerate() {
        if map.insert(id, slot).is_some() {
            return Err(ConfigError::duplicate_id(element, id));
        }
    }
    Ok(map)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

fn validate_matchers(config: &TallyConfig, matchers: &HashMap<i64, usize>) -> Result<()> {
    for matcher in &config.matchers {
        if let MatcherKind::Combination(combination) = &matcher.kind {
            if combination.children.is_empty() {
                return Err(ConfigError::EmptyCombination {
                    element: "matcher",
                    id: matcher.id,
                });
            }
            if combination.op == crate::matchers::LogicalOp::Not && combination.children.len() != 1
            {
                return Err(ConfigError::invalid_value(
                    "matcher",
                    matcher.id,
                    "children",
                    "NOT takes exactly one child",
                ));
            }
            for &child in &combination.children {
                if !matchers.contains_key(&child) {
                    return Err(ConfigError::unknown_reference(
                        "matcher",
                        matcher.id,
                        "matcher",
                        child,
                    ));
                }
            }
        }
    }

    // Cycle check over the combination graph.
    let mut marks = vec![Mark::White; config.matchers.len()];
    for slot in 0..config.matchers.len() {
        if marks[slot] == Mark::White {
            matcher_dfs(config, matchers, slot, &mut marks)?;
        }
    }
    Ok(())
}

fn matcher_dfs(
    config: &TallyConfig,
    matchers: &HashMap<i64, usize>,
    slot: usize,
    marks: &mut [Mark],
) -> Result<()> {
    marks[slot] = Mark::Gray;
    if let MatcherKind::Combination(combination) = &config.matchers[slot].kind {
        for &child in &combination.children {
            let child_slot = matchers[&child];
            match marks[child_slot] {
                Mark::Gray => {
                    return Err(ConfigError::cycle("matcher", config.matchers[slot].id));
                }
                Mark::White => matcher_dfs(config, matchers, child_slot, marks)?,
                Mark::Black => {}
            }
        }
    }
    marks[slot] = Mark::Black;
    Ok(())
}

fn validate_predicates(
    config: &TallyConfig,
    matchers: &HashMap<i64, usize>,
    predicates: &HashMap<i64, usize>,
) -> Result<()> {
    for predicate in &config.predicates {
        match &predicate.kind {
            PredicateKind::Simple(simple) => {
                for matcher_id in [simple.start, simple.stop, simple.stop_all]
                    .into_iter()
                    .flatten()
                {
                    if !matchers.contains_key(&matcher_id) {
                        return Err(ConfigError::unknown_reference(
                            "predicate",
                            predicate.id,
                            "matcher",
                            matcher_id,
                        ));
                    }
                }
                if simple.start.is_none() && simple.stop.is_none() && simple.stop_all.is_none() {
                    return Err(ConfigError::invalid_value(
                        "predicate",
                        predicate.id,
                        "matchers",
                        "at least one of start, stop, stop_all must be set",
                    ));
                }
            }
            PredicateKind::Combination(combination) => {
                if combination.children.is_empty() {
                    return Err(ConfigError::EmptyCombination {
                        element: "predicate",
                        id: predicate.id,
                    });
                }
                for &child in &combination.children {
                    if !predicates.contains_key(&child) {
                        return Err(ConfigError::unknown_reference(
                            "predicate",
                            predicate.id,
                            "predicate",
                            child,
                        ));
                    }
                }
            }
        }
    }

    let mut marks = vec![Mark::White; config.predicates.len()];
    for slot in 0..config.predicates.len() {
        if marks[slot] == Mark::White {
            predicate_dfs(config, predicates, slot, &mut marks)?;
        }
    }
    Ok(())
}

fn predicate_dfs(
    config: &TallyConfig,
    predicates: &HashMap<i64, usize>,
    slot: usize,
    marks: &mut [Mark],
) -> Result<()> {
    marks[slot] = Mark::Gray;
    if let PredicateKind::Combination(combination) = &config.predicates[slot].kind {
        for &child in &combination.children {
            let child_slot = predicates[&child];
            match marks[child_slot] {
                Mark::Gray => {
                    return Err(ConfigError::cycle("predicate", config.predicates[slot].id));
                }
                Mark::White => predicate_dfs(config, predicates, child_slot, marks)?,
                Mark::Black => {}
            }
        }
    }
    marks[slot] = Mark::Black;
    Ok(())
}

fn validate_metrics(
    config: &TallyConfig,
    matchers: &HashMap<i64, usize>,
    predicates: &HashMap<i64, usize>,
) -> Result<()> {
    let state_atoms: Vec<i32> = config.states.iter().map(|s| s.atom_id).collect();

    const FIVE_MINUTES_NS: i64 = 5 * 60 * 1_000_000_000;

    for metric in &config.metrics {
        if metric.bucket_size_ns <= 0 {
            return Err(ConfigError::invalid_value(
                "metric",
                metric.id,
                "bucket_size_ns",
                "must be positive",
            ));
        }
        if metric.bucket_size_ns < FIVE_MINUTES_NS {
            tracing::warn!(
                metric = metric.id,
                bucket_size_ns = metric.bucket_size_ns,
                "bucket size below five minutes; reports may be large"
            );
        }

        let check_matcher = |what: i64| -> Result<()> {
            if !matchers.contains_key(&what) {
                return Err(ConfigError::unknown_reference(
                    "metric", metric.id, "matcher", what,
                ));
            }
            Ok(())
        };

        match &metric.kind {
            MetricKind::Count { what } => check_matcher(*what)?,
            MetricKind::Duration { what, .. } => {
                let Some(&slot) = predicates.get(what) else {
                    return Err(ConfigError::unknown_reference(
                        "metric", metric.id, "predicate", *what,
                    ));
                };
                if !matches!(config.predicates[slot].kind, PredicateKind::Simple(_)) {
                    return Err(ConfigError::invalid_value(
                        "metric",
                        metric.id,
                        "what",
                        "duration metrics must name a simple predicate",
                    ));
                }
            }
            MetricKind::Value {
                what, value_field, ..
            }
            | MetricKind::Kll { what, value_field } => {
                check_matcher(*what)?;
                if *value_field == 0 {
                    return Err(ConfigError::invalid_value(
                        "metric",
                        metric.id,
                        "value_field",
                        "field positions are 1-based",
                    ));
                }
            }
            MetricKind::Gauge { what, trigger, .. } => {
                check_matcher(*what)?;
                if let Some(trigger) = trigger {
                    check_matcher(*trigger)?;
                }
            }
        }

        if let Some(condition) = metric.condition
            && !predicates.contains_key(&condition)
        {
            return Err(ConfigError::unknown_reference(
                "metric", metric.id, "predicate", condition,
            ));
        }

        for atom_id in &metric.state_atoms {
            if !state_atoms.contains(atom_id) {
                return Err(ConfigError::unknown_reference(
                    "metric",
                    metric.id,
                    "state atom",
                    i64::from(*atom_id),
                ));
            }
        }

        for activation in &metric.activations {
            check_matcher(activation.activation_matcher)?;
            if let Some(deactivation) = activation.deactivation_matcher {
                check_matcher(deactivation)?;
            }
            if activation.ttl_ns <= 0 {
                return Err(ConfigError::invalid_value(
                    "metric",
                    metric.id,
                    "activation ttl_ns",
                    "must be positive",
                ));
            }
        }
    }
    Ok(())
}

fn validate_alerts(config: &TallyConfig, metrics: &HashMap<i64, usize>) -> Result<()> {
    for alert in &config.alerts {
        if !metrics.contains_key(&alert.metric_id) {
            return Err(ConfigError::unknown_reference(
                "alert",
                alert.id,
                "metric",
                alert.metric_id,
            ));
        }
        if alert.num_buckets == 0 {
            return Err(ConfigError::invalid_value(
                "alert",
                alert.id,
                "num_buckets",
                "must be at least 1",
            ));
        }
    }
    Ok(())
}
