//! Event field access errors

use thiserror::Error;

use crate::value::FieldKind;

/// Errors that can occur when reading or patching event fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// The requested position does not exist in the event
    #[error("field position {position} out of range: event has {len} fields")]
    OutOfRange { position: usize, len: usize },

    /// The field at the requested position has a different type
    #[error("field position {position} is {actual}, expected {expected}")]
    WrongType {
        position: usize,
        expected: FieldKind,
        actual: FieldKind,
    },

    /// The event carries no attribution chain
    #[error("event has no attribution chain")]
    NoAttributionChain,
}

impl EventError {
    /// Create an out-of-range error
    #[inline]
    pub fn out_of_range(position: usize, len: usize) -> Self {
        Self::OutOfRange { position, len }
    }

    /// Create a wrong-type error
    #[inline]
    pub fn wrong_type(position: usize, expected: FieldKind, actual: FieldKind) -> Self {
        Self::WrongType {
            position,
            expected,
            actual,
        }
    }
}
