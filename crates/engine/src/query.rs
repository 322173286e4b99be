//! Restricted-query surface
//!
//! SQL over the restricted store is gated by an authorization ladder:
//! feature flag, store version, package resolution, key match, delegate
//! check, ambiguity. Failures surface through the caller's callback with
//! a textual reason and a typed `InvalidQueryReason`.

use tally_storage::QueryRows;

/// Typed reason a restricted query was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidQueryReason {
    FlagDisabled,
    UnsupportedSqliteVersion,
    ConfigKeyNotFound,
    ConfigKeyWithUnmatchedDelegate,
    AmbiguousConfigKey,
    InconsistentRowSize,
    QueryFailure,
}

/// The caller's result channel. Invoked synchronously, at most once per
/// query, while the processor holds its lock: implementations must not
/// block or re-enter the processor.
pub trait QueryCallback {
    fn send_results(&mut self, rows: QueryRows);
    fn send_failure(&mut self, error: &str, reason: InvalidQueryReason);
}
