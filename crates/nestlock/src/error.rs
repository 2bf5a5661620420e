//! Error types surfaced by the scheduler, the cluster glue and the executor.

use nestlock_protocol::LockDescriptor;
use nestlock_protocol::RequestHash;
use snafu::Snafu;

/// Errors from nestlock operations.
///
/// Lock-related variants carry the offending request's descriptor so the
/// failure is diagnosable without external tracing.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MutexError {
    /// The request was held (or waited) past its maximum locking time.
    #[snafu(display("lock timeout: {descriptor}"))]
    LockTimeout {
        /// Snapshot of the timed-out request.
        descriptor: Box<LockDescriptor>,
    },

    /// The request can provably never be admitted.
    #[snafu(display("dead end detected: {descriptor} collides with [{}]", join_hashes(colliding)))]
    DeadEndDetected {
        /// Snapshot of the refused request.
        descriptor: Box<LockDescriptor>,
        /// The foreign blocker and the waiter closing the cycle.
        colliding: Vec<RequestHash>,
    },

    /// A holder checked in after its own request had already timed out.
    #[snafu(display("watchdog rejected phase '{phase}': {descriptor}"))]
    WatchdogRejection {
        /// Phase that was being reported.
        phase: String,
        /// Snapshot of the timed-out request.
        descriptor: Box<LockDescriptor>,
    },

    /// No request with this hash is known to the scheduler.
    #[snafu(display("lock {hash} not found"))]
    LockNotFound {
        /// The unknown request id.
        hash: RequestHash,
    },

    /// A watchdog call was made outside of any locked scope of this executor.
    #[snafu(display("watchdog called outside of a locked scope"))]
    NotInLockedScope,

    /// The coordinator did not answer the handshake in time.
    #[snafu(display("coordinator not initialized: no VERIFY_COMPLETE within {waited_ms}ms"))]
    CoordinatorNotInitialized {
        /// How long the worker waited.
        waited_ms: u64,
    },

    /// Worker and coordinator speak different protocol versions.
    #[snafu(display("protocol version mismatch: local {local}, coordinator {remote}"))]
    VersionMismatch {
        /// Version of this process.
        local: String,
        /// Version reported by the coordinator.
        remote: String,
    },

    /// One participant runs with custom configuration and the other does not.
    #[snafu(display("configuration mismatch: local customized={local}, coordinator customized={remote}"))]
    ConfigurationMismatch {
        /// Whether this process uses custom configuration.
        local: bool,
        /// Whether the coordinator uses custom configuration.
        remote: bool,
    },

    /// A safe callback wrapper was armed twice.
    #[snafu(display("safe callback is already armed"))]
    SafeCallbackAlreadyArmed,

    /// Configuration failed validation.
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },

    /// The transport failed to deliver a message.
    #[snafu(display("transport error: {reason}"))]
    Transport {
        /// Rendered transport error chain.
        reason: String,
    },

    /// The scheduler went away while a caller was suspended.
    #[snafu(display("synchronizer disconnected while waiting on {hash}"))]
    Disconnected {
        /// Request the caller was waiting on.
        hash: RequestHash,
    },
}

impl MutexError {
    /// Descriptor of the affected request, if the error carries one.
    pub fn descriptor(&self) -> Option<&LockDescriptor> {
        match self {
            MutexError::LockTimeout { descriptor }
            | MutexError::DeadEndDetected { descriptor, .. }
            | MutexError::WatchdogRejection { descriptor, .. } => Some(descriptor),
            _ => None,
        }
    }

    /// Whether this is a `LockTimeout`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MutexError::LockTimeout { .. })
    }

    /// Whether this is a `DeadEndDetected`.
    pub fn is_dead_end(&self) -> bool {
        matches!(self, MutexError::DeadEndDetected { .. })
    }

    pub(crate) fn transport(error: anyhow::Error) -> Self {
        MutexError::Transport {
            reason: format!("{error:#}"),
        }
    }
}

fn join_hashes(hashes: &[RequestHash]) -> String {
    hashes.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
