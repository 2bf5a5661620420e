//! One-hop dead-end detection.
//!
//! A pending request `L` is a dead end when one of its foreign blockers `B`
//! has a pending descendant `P` (nested inside `B`'s call chain) that is itself
//! blocked by `L` or one of `L`'s chain ancestors. `B` cannot finish before `P`
//! runs, `P` cannot run before `L`'s chain finishes, and `L`'s chain cannot
//! finish before `B` releases.
//!
//! Cycles through more than two chains are not detected here; those surface
//! as timeouts.

use crate::types::LockRequest;
use crate::types::RequestHash;
use crate::verified::admission::running_blockers;

/// A request proven to be unadmittable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadEndReport {
    /// The refused request.
    pub hash: RequestHash,
    /// Foreign running request blocking it.
    pub blocker: RequestHash,
    /// Pending request in the blocker's chain that waits on the refused
    /// request's chain.
    pub waiter: RequestHash,
}

impl DeadEndReport {
    /// The hashes colliding with the refused request.
    pub fn colliding(&self) -> Vec<RequestHash> {
        vec![self.blocker, self.waiter]
    }
}

/// Whether `held` prevents `waiter` from being admitted.
#[inline]
fn conflicts(waiter: &LockRequest, held: &LockRequest) -> bool {
    !waiter.has_parent(&held.hash) && (waiter.single_access || held.single_access)
}

/// Look for a one-hop waits-for cycle through one of `blockers`.
///
/// `blockers` are the running requests related to `candidate`; declared
/// parents among them are skipped.
pub fn find_dead_end(
    queue: &[LockRequest],
    candidate: &LockRequest,
    blockers: &[&LockRequest],
) -> Option<DeadEndReport> {
    let in_candidate_chain = |hash: &RequestHash| *hash == candidate.hash || candidate.descends_from(hash);

    for blocker in blockers.iter().filter(|b| !candidate.has_parent(&b.hash) && conflicts(candidate, b)) {
        let waiters = queue
            .iter()
            .filter(|p| p.is_pending() && p.hash != candidate.hash && p.descends_from(&blocker.hash));

        for waiter in waiters {
            let closes_cycle = running_blockers(queue, waiter)
                .any(|held| in_candidate_chain(&held.hash) && conflicts(waiter, held));
            if closes_cycle {
                return Some(DeadEndReport {
                    hash: candidate.hash,
                    blocker: blocker.hash,
                    waiter: waiter.hash,
                });
            }
        }
    }

    None
}
