//! Admission decisions over a lock queue.

use crate::types::LockRequest;
use crate::types::LockStatus;
use crate::types::RequestHash;
use crate::verified::dead_end::DeadEndReport;
use crate::verified::dead_end::find_dead_end;

/// Decision for one pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request may run now.
    Admit,
    /// The request stays queued.
    Wait,
    /// The request can never be admitted.
    DeadEnd(DeadEndReport),
}

/// Running requests whose keys are related to `candidate`'s key.
pub fn running_blockers<'a>(
    queue: &'a [LockRequest],
    candidate: &'a LockRequest,
) -> impl Iterator<Item = &'a LockRequest> + 'a {
    queue
        .iter()
        .filter(move |r| r.hash != candidate.hash && r.is_running() && r.key.is_related(&candidate.key))
}

/// Pending exclusive requests on related keys that arrived before a shared
/// `candidate` and must not be overtaken by it.
///
/// A writer held up by the candidate's own call chain is skipped; that chain
/// has to finish before the writer can run.
pub fn queued_writers<'a>(
    queue: &'a [LockRequest],
    candidate: &'a LockRequest,
) -> impl Iterator<Item = &'a LockRequest> + 'a {
    let arrived = queue.iter().position(|r| r.hash == candidate.hash).unwrap_or(queue.len());
    queue[..arrived].iter().filter(move |writer| {
        writer.is_pending()
            && writer.single_access
            && writer.key.is_related(&candidate.key)
            && !running_blockers(queue, writer).any(|held| candidate.descends_from(&held.hash))
    })
}

/// True when the only things blocking `candidate` are exactly its declared
/// parents, i.e. a legitimate re-entrant nesting.
pub fn parents_satisfied(candidate: &LockRequest, blockers: &[&LockRequest]) -> bool {
    !candidate.parents.is_empty()
        && candidate.parents.iter().all(|p| blockers.iter().any(|b| b.hash == *p))
        && blockers.iter().all(|b| candidate.has_parent(&b.hash))
}

/// Evaluate one pending request against the current queue.
///
/// Exclusive requests need no related running request besides their parents.
/// Shared requests need every related running request to be shared and no
/// related exclusive request queued ahead of them, so a stream of readers
/// cannot starve a writer.
pub fn evaluate(queue: &[LockRequest], candidate: &LockRequest) -> Admission {
    debug_assert!(candidate.is_pending(), "ADMISSION: only pending requests are evaluated");

    let blockers: Vec<&LockRequest> = running_blockers(queue, candidate).collect();

    if parents_satisfied(candidate, &blockers) {
        return Admission::Admit;
    }

    let admissible = if candidate.single_access {
        blockers.is_empty()
    } else {
        blockers.iter().all(|b| !b.single_access) && queued_writers(queue, candidate).next().is_none()
    };

    if admissible {
        return Admission::Admit;
    }

    match find_dead_end(queue, candidate, &blockers) {
        Some(report) => Admission::DeadEnd(report),
        None => Admission::Wait,
    }
}

/// Run admission passes until one admits nothing.
///
/// Requests admitted earlier in a pass count as running for the requests
/// evaluated after them, so arrival order decides between equally eligible
/// exclusive requests. Dead ends are reported through `on_dead_end` and take
/// no further part in the computation.
///
/// Returns the admitted hashes in admission order.
pub fn compute_admissions<F>(queue: &[LockRequest], mut on_dead_end: F) -> Vec<RequestHash>
where
    F: FnMut(DeadEndReport),
{
    let mut work: Vec<LockRequest> = queue.to_vec();
    let mut admitted = Vec::new();

    // Each productive pass admits at least one request, so this is bounded.
    for _ in 0..=work.len() {
        let mut progressed = false;
        let mut index = 0;
        while index < work.len() {
            if !work[index].is_pending() {
                index += 1;
                continue;
            }
            match evaluate(&work, &work[index]) {
                Admission::Admit => {
                    work[index].status = LockStatus::Running;
                    admitted.push(work[index].hash);
                    progressed = true;
                    index += 1;
                }
                Admission::Wait => index += 1,
                Admission::DeadEnd(report) => {
                    work.remove(index);
                    on_dead_end(report);
                }
            }
        }
        if !progressed {
            break;
        }
    }

    admitted
}

/// Running requests that actually prevent `candidate` from being admitted.
///
/// Empty for a running candidate; a timed-out candidate keeps reporting what
/// held it up.
pub fn blocking_hashes(queue: &[LockRequest], candidate: &LockRequest) -> Vec<RequestHash> {
    if candidate.is_running() {
        return Vec::new();
    }
    running_blockers(queue, candidate)
        .filter(|b| !candidate.has_parent(&b.hash) && (candidate.single_access || b.single_access))
        .map(|b| b.hash)
        .collect()
}
