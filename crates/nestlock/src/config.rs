//! Mutex configuration.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_HANDSHAKE_TIMEOUT_MS;
use crate::error::MutexError;

/// Configuration shared by the scheduler, the cluster glue and the executor.
///
/// Every participant of a cluster must agree on whether it runs with custom
/// configuration; the flag is exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexConfig {
    /// Holding limit applied when a call does not pass its own.
    #[serde(default)]
    pub default_max_locking_time_ms: Option<u64>,
    /// Reject only the affected caller on timeout instead of escalating.
    #[serde(default)]
    pub continue_on_timeout: bool,
    /// Log full request chains when a dead end is detected.
    #[serde(default)]
    pub debug_dead_end: bool,
    /// Capture a backtrace for every request.
    #[serde(default)]
    pub debug_stacks: bool,
    /// How long a worker waits for `VERIFY_COMPLETE`.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            default_max_locking_time_ms: None,
            continue_on_timeout: false,
            debug_dead_end: false,
            debug_stacks: false,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl MutexConfig {
    /// Config that rejects timed-out callers instead of escalating.
    pub fn continue_on_timeout() -> Self {
        Self {
            continue_on_timeout: true,
            ..Self::default()
        }
    }

    /// Set the default holding limit.
    pub fn with_default_max_locking_time(mut self, limit: Duration) -> Self {
        self.default_max_locking_time_ms = Some(limit.as_millis() as u64);
        self
    }

    /// Default holding limit as a duration.
    pub fn default_max_locking_time(&self) -> Option<Duration> {
        self.default_max_locking_time_ms.map(Duration::from_millis)
    }

    /// Handshake wait as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Whether any setting the cluster must agree on deviates from the
    /// defaults. The handshake wait is local to each worker and not counted.
    pub fn is_customized(&self) -> bool {
        let shared = Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            ..self.clone()
        };
        shared != Self::default()
    }

    /// Check the configuration for values the scheduler cannot work with.
    pub fn validate(self) -> Result<Self, MutexError> {
        if self.default_max_locking_time_ms == Some(0) {
            return Err(MutexError::InvalidConfig {
                reason: "default_max_locking_time_ms must be positive".to_string(),
            });
        }
        if self.handshake_timeout_ms == 0 {
            return Err(MutexError::InvalidConfig {
                reason: "handshake_timeout_ms must be positive".to_string(),
            });
        }
        Ok(self)
    }
}
