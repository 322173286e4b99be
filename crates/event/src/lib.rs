//! Tally event value model
//!
//! This crate provides the foundational types that flow through the engine:
//! - `FieldValue` - a typed, positionally-addressed atom field
//! - `Event` - one decoded atom with tag id, timestamps and origin identity
//! - `DimensionKey` / `MetricDimensionKey` - hashable field projections used
//!   to slice aggregates
//!
//! # Design Principles
//!
//! - **Typed positional access**: field reads return `Result` with an error
//!   kind naming the position and the mismatched types, instead of a family
//!   of unchecked getters
//! - **Hashable everywhere**: float fields hash and compare by bit pattern
//!   so any projection can key a map
//! - **No engine knowledge**: this crate knows nothing about matchers,
//!   conditions or buckets

mod dimension;
mod error;
mod event;
mod value;

pub use dimension::{DimensionKey, MetricDimensionKey};
pub use error::EventError;
pub use event::{AttributionNode, Event};
pub use value::{FieldKind, FieldValue};

/// Result type for event field operations
pub type Result<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod value_test;
