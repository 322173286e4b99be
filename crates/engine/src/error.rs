//! Engine error taxonomy
//!
//! On the ingress path every one of these is converted to accounting and
//! swallowed; the event loop never aborts. Config, storage and query
//! surfaces propagate them to the caller.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A field read failed while decoding an event
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] tally_event::EventError),

    /// A config was rejected; no manager exists for it afterward
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] tally_config::ConfigError),

    /// A byte-size, dimension or rate guardrail fired
    #[error("guardrail hit: {0}")]
    GuardrailHit(String),

    /// Disk read or write failed
    #[error("storage failure: {0}")]
    StorageFailure(#[from] tally_storage::StorageError),

    /// A restricted SQL query failed
    #[error("query failure: {0}")]
    QueryFailure(String),

    /// The caller lacks a required permission
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Restricted data path and delegate/uid disagree
    #[error("restricted mismatch: {0}")]
    RestrictedMismatch(String),
}
