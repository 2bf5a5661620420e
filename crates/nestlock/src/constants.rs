//! Fixed bounds and defaults.
//!
//! Tiger Style: every collection the scheduler owns has an explicit upper
//! bound, checked with debug assertions on the hot path.

/// Maximum number of requests one scheduler queue is expected to hold.
pub const MAX_QUEUE_LENGTH: usize = 10_000;

/// Maximum number of segments in a lock key.
pub const MAX_KEY_SEGMENTS: usize = 64;

/// Phase history kept per request; older phases are dropped first.
pub const MAX_REPORTED_PHASES: usize = 64;

/// Timed-out requests remembered for late watchdog reports.
pub const MAX_TIMED_OUT_TOMBSTONES: usize = 1024;

/// Bounded wait for the coordinator's `VERIFY_COMPLETE`.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
