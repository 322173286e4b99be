//! Configuration error types

use thiserror::Error;

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur when parsing or validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to parse the uploaded payload
    #[error("failed to parse config payload: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Two config elements share an id
    #[error("duplicate {element} id {id}")]
    DuplicateId { element: &'static str, id: i64 },

    /// A reference points at an id that does not exist
    #[error("{referrer} {referrer_id} references unknown {element} {id}")]
    UnknownReference {
        referrer: &'static str,
        referrer_id: i64,
        element: &'static str,
        id: i64,
    },

    /// A combination matcher or predicate participates in a cycle
    #[error("cycle detected in {element} combination involving id {id}")]
    CycleDetected { element: &'static str, id: i64 },

    /// A combination has no children
    #[error("{element} {id} combination has no children")]
    EmptyCombination { element: &'static str, id: i64 },

    /// A field holds a value the engine cannot accept
    #[error("{element} {id} has invalid {field}: {message}")]
    InvalidValue {
        element: &'static str,
        id: i64,
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    /// Create a DuplicateId error
    pub fn duplicate_id(element: &'static str, id: i64) -> Self {
        Self::DuplicateId { element, id }
    }

    /// Create an UnknownReference error
    pub fn unknown_reference(
        referrer: &'static str,
        referrer_id: i64,
        element: &'static str,
        id: i64,
    ) -> Self {
        Self::UnknownReference {
            referrer,
            referrer_id,
            element,
            id,
        }
    }

    /// Create a CycleDetected error
    pub fn cycle(element: &'static str, id: i64) -> Self {
        Self::CycleDetected { element, id }
    }

    /// Create an InvalidValue error
    pub fn invalid_value(
        element: &'static str,
        id: i64,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            element,
            id,
            field,
            message: message.into(),
        }
    }
}
