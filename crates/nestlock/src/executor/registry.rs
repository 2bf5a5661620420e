//! Process-wide table of the requests each executor has in flight.
//!
//! The executor consults it before contacting the scheduler so that an
//! obvious dead end between chains of the same process fails without a
//! round trip.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::ExecutorId;
use crate::types::LockRequest;
use crate::types::LockStatus;
use crate::types::RequestHash;
use crate::verified;
use crate::verified::Admission;
use crate::verified::DeadEndReport;

/// Requests issued and not yet released, per executor.
#[derive(Debug, Default)]
pub struct LockRegistry {
    chains: Mutex<HashMap<ExecutorId, Vec<LockRequest>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the dead-end check for `candidate` against the executor's
    /// in-flight requests.
    pub fn check_dead_end(&self, executor: ExecutorId, candidate: &LockRequest) -> Option<DeadEndReport> {
        let chains = self.chains.lock();
        let mut queue = chains.get(&executor).cloned().unwrap_or_default();
        queue.push(candidate.clone());
        match verified::evaluate(&queue, candidate) {
            Admission::DeadEnd(report) => Some(report),
            Admission::Admit | Admission::Wait => None,
        }
    }

    /// Track a request that is about to be sent to the scheduler.
    pub fn insert(&self, executor: ExecutorId, request: LockRequest) {
        self.chains.lock().entry(executor).or_default().push(request);
    }

    /// Record that a tracked request was admitted.
    pub fn mark_running(&self, executor: ExecutorId, hash: RequestHash) {
        let mut chains = self.chains.lock();
        if let Some(request) = chains.get_mut(&executor).and_then(|c| c.iter_mut().find(|r| r.hash == hash)) {
            request.status = LockStatus::Running;
        }
    }

    /// Stop tracking a request.
    pub fn remove(&self, executor: ExecutorId, hash: RequestHash) {
        let mut chains = self.chains.lock();
        if let Some(chain) = chains.get_mut(&executor) {
            chain.retain(|r| r.hash != hash);
            if chain.is_empty() {
                chains.remove(&executor);
            }
        }
    }

    /// Number of tracked requests of `executor`.
    pub fn in_flight(&self, executor: ExecutorId) -> usize {
        self.chains.lock().get(&executor).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.chains.lock().is_empty()
    }
}
