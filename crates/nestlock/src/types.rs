//! Lock request model shared by the scheduler, the admission functions and the
//! executor.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub use nestlock_protocol::LockDescriptor;
pub use nestlock_protocol::LockStatus;
pub use nestlock_protocol::PhaseReport;
pub use nestlock_protocol::RequestHash;
pub use nestlock_protocol::WorkerId;

use crate::constants::MAX_REPORTED_PHASES;
use crate::key::LockKey;

/// Identifies one executor instance inside a process.
///
/// Used to scope re-entrancy: only stack entries created by the same executor
/// become parents of a nested request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutorId(u64);

impl ExecutorId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor-{}", self.0)
    }
}

/// Who issued a request, as seen by the scheduler that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOrigin {
    /// A caller inside the scheduler's own process.
    Local,
    /// A remote worker process.
    Worker(WorkerId),
}

impl RequestOrigin {
    /// The remote worker, if any.
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            RequestOrigin::Local => None,
            RequestOrigin::Worker(id) => Some(*id),
        }
    }
}

/// Queue timestamps (Unix ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockTiming {
    /// When the request was enqueued.
    pub enqueued_at_ms: u64,
    /// When the request was admitted.
    pub admitted_at_ms: Option<u64>,
}

/// The unit the scheduler queues and admits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Unique request id.
    pub hash: RequestHash,
    /// Canonical key.
    pub key: LockKey,
    /// Exclusive (`true`) or shared (`false`).
    pub single_access: bool,
    /// Holding limit; `None` means no timeout.
    pub max_locking_time: Option<Duration>,
    /// Open related requests of the same call chain this one may coexist with.
    pub parents: Vec<RequestHash>,
    /// All ancestors of the same call chain, outermost first.
    pub tree: Vec<RequestHash>,
    /// Executor that issued the request; never sent across processes.
    pub owning_chain: Option<ExecutorId>,
    /// Lifecycle state.
    pub status: LockStatus,
    /// Queue timestamps.
    pub timing: LockTiming,
    /// Checkpoints reported by the holder.
    pub reported_phases: Vec<PhaseReport>,
    /// Call site captured when stack capturing is enabled.
    pub call_site: Option<String>,
}

impl LockRequest {
    /// Create a pending request with a fresh hash and no chain context.
    pub fn new(key: impl Into<LockKey>, single_access: bool) -> Self {
        Self {
            hash: RequestHash::generate(),
            key: key.into(),
            single_access,
            max_locking_time: None,
            parents: Vec::new(),
            tree: Vec::new(),
            owning_chain: None,
            status: LockStatus::Pending,
            timing: LockTiming::default(),
            reported_phases: Vec::new(),
            call_site: None,
        }
    }

    /// Set the holding limit.
    pub fn with_max_locking_time(mut self, limit: Option<Duration>) -> Self {
        self.max_locking_time = limit;
        self
    }

    /// Set the re-entrancy parents.
    pub fn with_parents(mut self, parents: Vec<RequestHash>) -> Self {
        self.parents = parents;
        self
    }

    /// Set the chain ancestry.
    pub fn with_tree(mut self, tree: Vec<RequestHash>) -> Self {
        self.tree = tree;
        self
    }

    /// Whether the request has been admitted.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.status == LockStatus::Running
    }

    /// Whether the request is still waiting.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.status == LockStatus::Pending
    }

    /// Whether `other` is a declared parent of this request.
    #[inline]
    pub fn has_parent(&self, other: &RequestHash) -> bool {
        self.parents.contains(other)
    }

    /// Whether `other` is somewhere in this request's chain.
    #[inline]
    pub fn descends_from(&self, other: &RequestHash) -> bool {
        self.tree.contains(other) || self.parents.contains(other)
    }

    /// Append a phase checkpoint, keeping the most recent entries.
    pub fn record_phase(&mut self, phase: &str, at_ms: u64) {
        if self.reported_phases.len() >= MAX_REPORTED_PHASES {
            self.reported_phases.remove(0);
        }
        self.reported_phases.push(PhaseReport {
            phase: phase.to_string(),
            at_ms,
        });
    }

    /// Holding limit in milliseconds.
    pub fn max_locking_time_ms(&self) -> Option<u64> {
        self.max_locking_time.map(|d| d.as_millis() as u64)
    }

    /// Snapshot for errors and lock-info replies.
    pub fn descriptor(&self, blocked_by: Vec<RequestHash>, worker: Option<WorkerId>) -> LockDescriptor {
        LockDescriptor {
            hash: self.hash,
            key: self.key.segments().to_vec(),
            single_access: self.single_access,
            max_locking_time_ms: self.max_locking_time_ms(),
            status: self.status,
            enqueued_at_ms: self.timing.enqueued_at_ms,
            admitted_at_ms: self.timing.admitted_at_ms,
            parents: self.parents.clone(),
            tree: self.tree.clone(),
            blocked_by,
            reported_phases: self.reported_phases.clone(),
            worker,
            call_site: self.call_site.clone(),
        }
    }
}

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
