//! Dimension keys
//!
//! A `DimensionKey` is an ordered tuple of field values projected out of an
//! event; two keys are equal iff the projections match positionally and
//! value-wise. `MetricDimensionKey` pairs the event projection with the
//! joined state-atom projection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

/// An ordered, hashable projection of event fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
    values: Vec<FieldValue>,
}

impl DimensionKey {
    /// The empty key, used by unsliced metrics
    pub fn empty() -> Self {
        Self { values: Vec::new() }
    }

    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Rough in-memory footprint, used by byte-size guardrails
    pub fn byte_size(&self) -> usize {
        self.values
            .iter()
            .map(|v| match v {
                FieldValue::Str(s) => std::mem::size_of::<FieldValue>() + s.len(),
                FieldValue::Bytes(b) => std::mem::size_of::<FieldValue>() + b.len(),
                _ => std::mem::size_of::<FieldValue>(),
            })
            .sum()
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<FieldValue>> for DimensionKey {
    fn from(values: Vec<FieldValue>) -> Self {
        Self { values }
    }
}

/// The full slicing key of a metric aggregate: the event-field projection
/// plus the state-atom projection joined at event time
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDimensionKey {
    what: DimensionKey,
    state: DimensionKey,
}

impl MetricDimensionKey {
    pub fn new(what: DimensionKey, state: DimensionKey) -> Self {
        Self { what, state }
    }

    /// Key with no slicing at all
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn what(&self) -> &DimensionKey {
        &self.what
    }

    pub fn state(&self) -> &DimensionKey {
        &self.state
    }

    pub fn byte_size(&self) -> usize {
        self.what.byte_size() + self.state.byte_size()
    }
}

impl fmt::Display for MetricDimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "what={} state={}", self.what, self.state)
    }
}
