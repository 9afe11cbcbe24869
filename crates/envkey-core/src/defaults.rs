//! Centralized default constants for envkey-source.
//!
//! **This module is the single source of truth** for shared default values.
//! The daemon, client, and CLI crates reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// FETCH
// =============================================================================

/// Default API host when the ENVKEY carries no host override.
pub const DEFAULT_HOST: &str = "api-v2.envkey.com";

/// Protocol version sent as the `fetchServiceVersion` query param.
pub const FETCH_SERVICE_VERSION: u32 = 2;

/// Number of failover endpoints tried after the base host.
pub const NUM_FAILOVERS: u32 = 2;

/// Client name reported when the caller doesn't supply one.
pub const DEFAULT_CLIENT_NAME: &str = "fetch";

/// Overall HTTP timeout, also used for the TLS handshake.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 20.0;

/// Extra fetch attempts after the first failure.
pub const DEFAULT_RETRIES: u8 = 3;

/// Base of the exponential retry backoff, in seconds.
pub const DEFAULT_RETRY_BACKOFF: f64 = 1.0;

// =============================================================================
// PARSER
// =============================================================================

/// Upper bound on `inheritsEnvironmentId` hops before a chain is treated as
/// broken.
pub const INHERITANCE_FOLLOW_CAP: usize = 100;

// =============================================================================
// DAEMON
// =============================================================================

/// Loopback port of the daemon's HTTP control surface.
pub const DAEMON_HTTP_PORT: u16 = 19409;

/// Loopback port of the daemon's TCP notification stream.
pub const DAEMON_TCP_PORT: u16 = 19410;

/// Interval between websocket pings; a pong must arrive within the same
/// interval.
pub const WS_PING_INTERVAL_SECS: u64 = 10;

/// Minimum websocket reconnect backoff.
pub const WS_BACKOFF_MIN_SECS: u64 = 2;

/// Maximum websocket reconnect backoff.
pub const WS_BACKOFF_MAX_SECS: u64 = 10;

/// Multiplier applied to the backoff after each failed dial.
pub const WS_BACKOFF_FACTOR: f64 = 1.5;

/// Upper bound of the randomized sleep before every daemon-triggered
/// refetch. Spreads a big update across hundreds of ENVKEYs instead of
/// slamming the server at the same instant.
pub const FETCH_JITTER_MS: u64 = 500;

/// Suspension watcher tick.
pub const SUSPENSION_CHECK_INTERVAL_SECS: u64 = 10;

/// Drift beyond which the process is considered to have been suspended.
pub const SUSPENSION_TOLERANCE_MS: u64 = 100;

// =============================================================================
// CLI / WATCH
// =============================================================================

/// Default minimum delay between child restarts under `--watch`.
pub const DEFAULT_WATCH_THROTTLE_MS: u32 = 5000;

/// Default percentage of connected processes reloaded per rolling batch.
pub const DEFAULT_ROLLING_PCT: u8 = 25;

/// Grace period between SIGTERM and SIGKILL when stopping a watched child.
pub const EXIT_SIGNAL_TIMEOUT_SECS: u64 = 3;

// =============================================================================
// DISK LAYOUT
// =============================================================================

/// Directory under `$HOME` holding cache, logs, and app keys.
pub const ENVKEY_DIR: &str = ".envkey";

/// Cache subdirectory name.
pub const CACHE_DIR: &str = "cache";

/// Log subdirectory name.
pub const LOG_DIR: &str = "logs";

/// Daemon log file name.
pub const DAEMON_LOG_FILE: &str = "envkey-source-daemon.log";
