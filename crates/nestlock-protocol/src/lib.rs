//! Wire types exchanged between nestlock workers and the coordinator.
//!
//! Every message carries an `action` tag so that the JSON form stays readable
//! when captured from a socket or a log:
//!
//! ```json
//! {"action": "LOCK", "hash": "…", "key": ["root", "users"], "single_access": true, …}
//! {"action": "CONTINUE", "hash": "…", "rejected": "TIMEOUT", …}
//! ```
//!
//! The enum is closed: adding an action is a protocol change and bumps
//! [`PROTOCOL_VERSION`].

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Version exchanged during the `VERIFY` handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Globally unique identifier of one lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestHash(pub Uuid);

impl RequestHash {
    /// Generate a fresh random request id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of a worker process attached to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle state of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    /// Queued, waiting for admission.
    Pending,
    /// Admitted; the holder is executing its body.
    Running,
    /// The request outlived its maximum locking time.
    Timeouted,
}

impl LockStatus {
    /// Lower-case name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Pending => "pending",
            LockStatus::Running => "running",
            LockStatus::Timeouted => "timeouted",
        }
    }
}

/// Reason attached to a `CONTINUE` that is actually a forced failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// The request exceeded its maximum locking time.
    Timeout,
    /// The request was refused by the scheduler (dead end).
    Exception,
}

/// Diagnostic checkpoint reported by a lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    /// Free-form phase name chosen by the holder.
    pub phase: String,
    /// When the phase was reported (Unix ms).
    pub at_ms: u64,
}

/// Snapshot of a lock request, attached to errors and lock-info replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDescriptor {
    /// Request id.
    pub hash: RequestHash,
    /// Canonical key segments.
    pub key: Vec<String>,
    /// Exclusive (`true`) or shared (`false`).
    pub single_access: bool,
    /// Maximum locking time in milliseconds, if any.
    pub max_locking_time_ms: Option<u64>,
    /// Status at the time of the snapshot.
    pub status: LockStatus,
    /// When the request entered the queue (Unix ms).
    pub enqueued_at_ms: u64,
    /// When the request was admitted (Unix ms).
    pub admitted_at_ms: Option<u64>,
    /// Open requests of the same call chain this one may coexist with.
    pub parents: Vec<RequestHash>,
    /// All ancestors of the same call chain, outermost first.
    pub tree: Vec<RequestHash>,
    /// Running requests currently preventing admission.
    pub blocked_by: Vec<RequestHash>,
    /// Phase history reported through the watchdog.
    pub reported_phases: Vec<PhaseReport>,
    /// Worker that issued the request, `None` for coordinator-local requests.
    pub worker: Option<WorkerId>,
    /// Captured call site, present when stack capturing is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_site: Option<String>,
}

impl LockDescriptor {
    /// Key rendered as a `/`-joined path.
    pub fn key_path(&self) -> String {
        self.key.join("/")
    }
}

impl fmt::Display for LockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.single_access { "single" } else { "multi" };
        write!(f, "lock '{}' ({}, {}-access, {})", self.key_path(), self.hash, mode, self.status.as_str())?;
        if !self.blocked_by.is_empty() {
            let blockers: Vec<String> = self.blocked_by.iter().map(ToString::to_string).collect();
            write!(f, " blocked by [{}]", blockers.join(", "))?;
        }
        if let Some(phase) = self.reported_phases.last() {
            write!(f, " last phase '{}'", phase.phase)?;
        }
        Ok(())
    }
}

/// Messages carried between workers and the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutexMessage {
    /// Worker → coordinator: enqueue a lock request.
    Lock {
        hash: RequestHash,
        key: Vec<String>,
        single_access: bool,
        max_locking_time_ms: Option<u64>,
        parents: Vec<RequestHash>,
        #[serde(default)]
        tree: Vec<RequestHash>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_site: Option<String>,
    },
    /// Worker → coordinator: release a request.
    Unlock { hash: RequestHash },
    /// Coordinator → worker: the request was admitted, or forcibly failed when
    /// `rejected` is set.
    Continue {
        hash: RequestHash,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejected: Option<RejectReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        descriptor: Option<LockDescriptor>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        colliding: Vec<RequestHash>,
    },
    /// Worker → coordinator: handshake before the first lock.
    Verify { version: String },
    /// Coordinator → worker: handshake reply.
    VerifyComplete { version: String, uses_custom_config: bool },
    /// Worker → coordinator: phase checkpoint from a lock holder.
    WatchdogReport { hash: RequestHash, phase: String },
    /// Coordinator → worker: request state after a watchdog report, `None` if
    /// the request is unknown.
    WatchdogStatus { hash: RequestHash, descriptor: Option<LockDescriptor> },
    /// Worker → coordinator: ask for a request snapshot.
    LockInfo { hash: RequestHash },
    /// Coordinator → worker: snapshot reply.
    LockInfoReply { hash: RequestHash, descriptor: Option<LockDescriptor> },
}

impl MutexMessage {
    /// Wire name of the action.
    pub fn action(&self) -> &'static str {
        match self {
            MutexMessage::Lock { .. } => "LOCK",
            MutexMessage::Unlock { .. } => "UNLOCK",
            MutexMessage::Continue { .. } => "CONTINUE",
            MutexMessage::Verify { .. } => "VERIFY",
            MutexMessage::VerifyComplete { .. } => "VERIFY_COMPLETE",
            MutexMessage::WatchdogReport { .. } => "WATCHDOG_REPORT",
            MutexMessage::WatchdogStatus { .. } => "WATCHDOG_STATUS",
            MutexMessage::LockInfo { .. } => "LOCK_INFO",
            MutexMessage::LockInfoReply { .. } => "LOCK_INFO_REPLY",
        }
    }

    /// Request id the message refers to, if any.
    pub fn hash(&self) -> Option<RequestHash> {
        match self {
            MutexMessage::Lock { hash, .. }
            | MutexMessage::Unlock { hash }
            | MutexMessage::Continue { hash, .. }
            | MutexMessage::WatchdogReport { hash, .. }
            | MutexMessage::WatchdogStatus { hash, .. }
            | MutexMessage::LockInfo { hash }
            | MutexMessage::LockInfoReply { hash, .. } => Some(*hash),
            MutexMessage::Verify { .. } | MutexMessage::VerifyComplete { .. } => None,
        }
    }
}

/// Encode a message as JSON bytes.
pub fn encode(message: &MutexMessage) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(message)
}

/// Decode a message from JSON bytes.
pub fn decode(bytes: &[u8]) -> serde_json::Result<MutexMessage> {
    serde_json::from_slice(bytes)
}
