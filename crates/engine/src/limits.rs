//! Engine guardrail constants
//!
//! Every rate limit, byte budget and hard cap the engine enforces lives
//! here. Values are nanoseconds unless the name says otherwise.

pub const NS_PER_SEC: i64 = 1_000_000_000;
pub const NS_PER_DAY: i64 = 24 * 3_600 * NS_PER_SEC;

/// byteSize() is assumed expensive; per-config checks are rate limited
pub const MIN_BYTE_SIZE_CHECK_PERIOD_NS: i64 = 10 * NS_PER_SEC;

/// Minimum spacing of data-ready broadcasts per config
pub const MIN_BROADCAST_PERIOD_NS: i64 = 60 * NS_PER_SEC;

/// Minimum spacing of activation broadcasts per uid
pub const MIN_ACTIVATION_BROADCAST_PERIOD_NS: i64 = 10 * NS_PER_SEC;

/// The puller cache is cleared when event time advances past this
pub const PULLER_CACHE_CLEAR_INTERVAL_SEC: i64 = 1;

/// Restricted-data TTL enforcement cadence
pub const MIN_TTL_CHECK_PERIOD_NS: i64 = 60 * 60 * NS_PER_SEC;

/// Restricted-data flush cadence
pub const MIN_FLUSH_RESTRICTED_PERIOD_NS: i64 = 20 * 60 * NS_PER_SEC;

/// Restricted-store guardrail enforcement cadence
pub const MIN_DB_GUARDRAIL_ENFORCEMENT_PERIOD_NS: i64 = 60 * 60 * NS_PER_SEC;

/// Disk writes refuse to repeat inside this window; file names have
/// one-second resolution and would collide
pub const WRITE_COOL_DOWN_NS: i64 = 15 * NS_PER_SEC;

/// Hard byte budget per config; crossing it drops data
pub const MAX_METRICS_BYTES_PER_CONFIG: usize = 2 * 1024 * 1024;

/// In-memory bytes that trigger a dump request
pub const DEFAULT_TRIGGER_BYTES: usize = 192 * 1024;

/// Buffered restricted bytes that trigger a store flush
pub const RESTRICTED_TRIGGER_FLUSH_BYTES: usize = 25 * 1024;

/// Restricted store size cap
pub const MAX_RESTRICTED_STORE_BYTES: usize = 100 * 1024 * 1024;

/// Maximum dimensions tracked per metric
pub const DIMENSION_HARD_LIMIT: usize = 800;

/// Maximum concurrently tracked slices per condition tracker
pub const CONDITION_SLICE_HARD_LIMIT: usize = 800;

/// Default row TTL for restricted data
pub const DEFAULT_RESTRICTED_DATA_TTL_DAYS: u32 = 7;

/// Uid range per device user; `uid / PER_USER_RANGE` is the user id
pub const PER_USER_RANGE: i32 = 100_000;
