//! Hard-coded atom ids and principals
//!
//! A handful of atoms get server-side treatment before regular dispatch;
//! their ids and field layouts are pinned here rather than configured.

/// Isolated-to-host uid mapping updates
pub const ISOLATED_UID_CHANGED: i32 = 43;

/// Emitted by the engine itself when an anomaly is declared
pub const ANOMALY_DETECTED: i32 = 46;

/// Client-labelled breadcrumbs; fields are (uid, label, state)
pub const APP_BREADCRUMB_REPORTED: i32 = 47;

/// Install-train state; requires privileged fixup
pub const BINARY_PUSH_STATE_CHANGED: i32 = 102;

/// Watchdog-driven rollback; requires privileged fixup
pub const WATCHDOG_ROLLBACK_OCCURRED: i32 = 104;

/// Socket-loss marker from the wire decoder
pub const STATS_SOCKET_LOSS_REPORTED: i32 = 752;

/// The engine's own uid; allowed to spoof breadcrumb uids
pub const ENGINE_UID: i32 = 1066;

/// Permission names checked for privileged atoms
pub const PERMISSION_DUMP: &str = "DUMP";
pub const PERMISSION_PACKAGE_USAGE_STATS: &str = "PACKAGE_USAGE_STATS";

// BINARY_PUSH_STATE_CHANGED status codes
pub const BINARY_PUSH_INSTALL_SUCCESS: i32 = 5;
pub const BINARY_PUSH_ROLLBACK_INITIATED: i32 = 12;
pub const BINARY_PUSH_ROLLBACK_SUCCESS: i32 = 13;

// WATCHDOG_ROLLBACK_OCCURRED rollback types
pub const WATCHDOG_ROLLBACK_INITIATE: i32 = 1;
pub const WATCHDOG_ROLLBACK_SUCCESS: i32 = 2;

// Experiment-id markers appended relative to a train's first id
pub const MARKER_INSTALL_SUCCESS: i64 = 1;
pub const MARKER_ROLLBACK_INITIATED: i64 = 2;
pub const MARKER_ROLLBACK_SUCCESS: i64 = 3;
pub const MARKER_WATCHDOG_ROLLBACK_INITIATE: i64 = 4;
pub const MARKER_WATCHDOG_ROLLBACK_SUCCESS: i64 = 5;
