//! The queue-owning scheduler.
//!
//! All queue mutations (enqueue, release, expiry, admission) happen under one
//! mutex and never await while holding it, so no two admission passes
//! interleave. Remote grants are pushed into an outbox channel and sent by
//! the coordinator's forwarding task in order.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use nestlock_protocol::MutexMessage;
use nestlock_protocol::RejectReason;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::config::MutexConfig;
use crate::constants::MAX_QUEUE_LENGTH;
use crate::constants::MAX_TIMED_OUT_TOMBSTONES;
use crate::error::MutexError;
use crate::timeout::FailLoudTimeoutHandler;
use crate::timeout::TimeoutAction;
use crate::timeout::TimeoutHandler;
use crate::types::LockDescriptor;
use crate::types::LockRequest;
use crate::types::LockStatus;
use crate::types::LockTiming;
use crate::types::RequestHash;
use crate::types::RequestOrigin;
use crate::types::WorkerId;
use crate::types::now_unix_ms;
use crate::verified;
use crate::verified::DeadEndReport;

/// Outcome delivered to an in-process caller.
pub(crate) type Grant = Result<(), MutexError>;

/// How a suspended caller is woken.
#[derive(Debug)]
pub(crate) enum Waiter {
    /// In-process caller; `None` once the grant has been delivered.
    Local(Option<oneshot::Sender<Grant>>),
    /// Caller in a worker process, reached through the outbox.
    Remote(WorkerId),
}

impl Waiter {
    fn origin(&self) -> RequestOrigin {
        match self {
            Waiter::Local(_) => RequestOrigin::Local,
            Waiter::Remote(worker) => RequestOrigin::Worker(*worker),
        }
    }
}

/// Work the coordinator's forwarding task performs on the scheduler's behalf.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Send a message to one worker.
    Message { to: WorkerId, message: MutexMessage },
    /// Ask the transport to terminate a worker.
    Terminate { worker: WorkerId },
}

#[derive(Debug, Default)]
struct SchedulerState {
    /// Requests in arrival order.
    queue: Vec<LockRequest>,
    /// Suspension handle per queued request.
    waiters: HashMap<RequestHash, Waiter>,
    /// Timeout timers per queued request.
    timers: HashMap<RequestHash, AbortHandle>,
    /// Force-unlocked requests, kept so late watchdog reports still fail.
    timed_out: HashMap<RequestHash, (LockDescriptor, RequestOrigin)>,
    timed_out_order: VecDeque<RequestHash>,
}

impl SchedulerState {
    fn position(&self, hash: RequestHash) -> Option<usize> {
        self.queue.iter().position(|r| r.hash == hash)
    }

    fn origin(&self, hash: RequestHash) -> RequestOrigin {
        self.waiters.get(&hash).map(Waiter::origin).unwrap_or(RequestOrigin::Local)
    }

    fn describe(&self, index: usize) -> LockDescriptor {
        let request = &self.queue[index];
        let blocked_by = verified::blocking_hashes(&self.queue, request);
        request.descriptor(blocked_by, self.origin(request.hash).worker())
    }

    /// Remove a request together with its waiter and timer.
    fn remove(&mut self, hash: RequestHash) -> Option<(LockRequest, Option<Waiter>)> {
        let index = self.position(hash)?;
        let request = self.queue.remove(index);
        if let Some(timer) = self.timers.remove(&hash) {
            timer.abort();
        }
        Some((request, self.waiters.remove(&hash)))
    }

    fn remember_timed_out(&mut self, descriptor: LockDescriptor, origin: RequestOrigin) {
        if self.timed_out_order.len() >= MAX_TIMED_OUT_TOMBSTONES {
            if let Some(oldest) = self.timed_out_order.pop_front() {
                self.timed_out.remove(&oldest);
            }
        }
        self.timed_out_order.push_back(descriptor.hash);
        self.timed_out.insert(descriptor.hash, (descriptor, origin));
    }

    fn forget_timed_out(&mut self, hash: RequestHash) -> bool {
        if self.timed_out.remove(&hash).is_some() {
            self.timed_out_order.retain(|h| *h != hash);
            true
        } else {
            false
        }
    }
}

/// Owns one queue of lock requests and decides admissions.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    config: MutexConfig,
    timeout_handler: Arc<dyn TimeoutHandler>,
    outbox: Option<mpsc::UnboundedSender<Outbound>>,
}

impl Scheduler {
    pub(crate) fn new(
        config: MutexConfig,
        timeout_handler: Option<Arc<dyn TimeoutHandler>>,
        outbox: Option<mpsc::UnboundedSender<Outbound>>,
    ) -> Arc<Self> {
        let timeout_handler = timeout_handler
            .unwrap_or_else(|| Arc::new(FailLoudTimeoutHandler::new(config.continue_on_timeout)));
        Arc::new(Self {
            state: Mutex::new(SchedulerState::default()),
            config,
            timeout_handler,
            outbox,
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &MutexConfig {
        &self.config
    }

    /// Number of queued requests, pending and running.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff the queue, the waiters and the timers are all empty.
    pub fn is_clear(&self) -> bool {
        let state = self.state.lock();
        state.queue.is_empty() && state.waiters.is_empty() && state.timers.is_empty()
    }

    /// Snapshot of the queue in arrival order.
    pub fn snapshot(&self) -> Vec<LockDescriptor> {
        let state = self.state.lock();
        (0..state.queue.len()).map(|i| state.describe(i)).collect()
    }

    /// Enqueue a request, arm its timer and run admission.
    pub(crate) fn enqueue(self: &Arc<Self>, mut request: LockRequest, waiter: Waiter) {
        let hash = request.hash;
        request.status = LockStatus::Pending;
        request.timing = LockTiming {
            enqueued_at_ms: now_unix_ms(),
            admitted_at_ms: None,
        };

        let mut state = self.state.lock();
        debug_assert!(state.queue.len() < MAX_QUEUE_LENGTH, "SCHEDULER: queue exceeds {MAX_QUEUE_LENGTH} requests");

        if state.position(hash).is_some() {
            // Dropping the waiter wakes a local caller with `Disconnected`.
            warn!(hash = %hash, "duplicate request hash, ignoring lock");
            return;
        }

        debug!(
            hash = %hash,
            key = %request.key,
            single_access = request.single_access,
            parents = request.parents.len(),
            origin = ?waiter.origin(),
            "lock enqueued"
        );

        let limit = request.max_locking_time;
        state.queue.push(request);
        state.waiters.insert(hash, waiter);
        if let Some(limit) = limit {
            let timer = self.spawn_timer(hash, limit);
            state.timers.insert(hash, timer);
        }

        self.run_admission(&mut state);
    }

    /// Remove a request and re-run admission. Returns false if the hash was
    /// unknown.
    pub(crate) fn release(&self, hash: RequestHash) -> bool {
        let mut state = self.state.lock();
        let forgotten = state.forget_timed_out(hash);
        let Some((request, _)) = state.remove(hash) else {
            return forgotten;
        };
        debug!(
            hash = %hash,
            key = %request.key,
            held_ms = request.timing.admitted_at_ms.map(|at| now_unix_ms().saturating_sub(at)),
            "lock released"
        );
        self.run_admission(&mut state);
        true
    }

    /// Append a watchdog phase. Returns the request's descriptor, or `None`
    /// if the hash is unknown.
    pub(crate) fn record_phase(&self, hash: RequestHash, phase: &str) -> Option<LockDescriptor> {
        let mut state = self.state.lock();
        if let Some((descriptor, _)) = state.timed_out.get(&hash) {
            return Some(descriptor.clone());
        }
        let index = state.position(hash)?;
        state.queue[index].record_phase(phase, now_unix_ms());
        Some(state.describe(index))
    }

    /// Descriptor of a queued or recently timed-out request.
    pub fn lock_info(&self, hash: RequestHash) -> Option<LockDescriptor> {
        let state = self.state.lock();
        match state.position(hash) {
            Some(index) => Some(state.describe(index)),
            None => state.timed_out.get(&hash).map(|(descriptor, _)| descriptor.clone()),
        }
    }

    /// Remove every request owned by `worker`. Returns how many were dropped.
    pub(crate) fn drop_worker(&self, worker: WorkerId) -> usize {
        let mut state = self.state.lock();
        let owned: Vec<RequestHash> = state
            .waiters
            .iter()
            .filter(|(_, waiter)| matches!(waiter, Waiter::Remote(id) if *id == worker))
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &owned {
            state.remove(*hash);
        }
        let SchedulerState {
            timed_out,
            timed_out_order,
            ..
        } = &mut *state;
        timed_out.retain(|_, (_, origin)| *origin != RequestOrigin::Worker(worker));
        timed_out_order.retain(|h| timed_out.contains_key(h));

        if !owned.is_empty() {
            warn!(worker = %worker, released = owned.len(), "dropped locks of departed worker");
            self.run_admission(&mut state);
        }
        owned.len()
    }

    fn spawn_timer(self: &Arc<Self>, hash: RequestHash, limit: Duration) -> AbortHandle {
        let scheduler = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.expire(hash);
            }
        })
        .abort_handle()
    }

    /// Timer callback: mark the request timed out and apply the handler's
    /// verdict.
    pub(crate) fn expire(&self, hash: RequestHash) {
        let (descriptor, origin, was_admitted) = {
            let mut state = self.state.lock();
            state.timers.remove(&hash);
            let Some(index) = state.position(hash) else {
                return;
            };
            let was_admitted = state.queue[index].timing.admitted_at_ms.is_some();
            state.queue[index].status = LockStatus::Timeouted;
            (state.describe(index), state.origin(hash), was_admitted)
        };

        match self.timeout_handler.handle_timeout(&descriptor, &origin) {
            TimeoutAction::RejectCaller => self.reject_timed_out(hash, was_admitted),
            TimeoutAction::Terminate => match origin {
                RequestOrigin::Worker(worker) => {
                    error!(worker = %worker, hash = %hash, "terminating worker holding a timed-out lock");
                    self.send(Outbound::Terminate { worker });
                    self.drop_worker(worker);
                }
                RequestOrigin::Local => {
                    error!(hash = %hash, key = %descriptor.key_path(), "coordinator-local lock timed out, aborting");
                    std::process::abort();
                }
            },
        }
    }

    fn reject_timed_out(&self, hash: RequestHash, was_admitted: bool) {
        let mut state = self.state.lock();
        let Some(index) = state.position(hash) else {
            return;
        };
        let descriptor = state.describe(index);
        let Some((_, waiter)) = state.remove(hash) else {
            return;
        };
        let origin = waiter.as_ref().map(Waiter::origin).unwrap_or(RequestOrigin::Local);
        state.remember_timed_out(descriptor.clone(), origin);

        match waiter {
            Some(Waiter::Local(Some(grant))) => {
                let _ = grant.send(Err(MutexError::LockTimeout {
                    descriptor: Box::new(descriptor),
                }));
            }
            Some(Waiter::Remote(worker)) if !was_admitted => self.send(Outbound::Message {
                to: worker,
                message: MutexMessage::Continue {
                    hash,
                    rejected: Some(RejectReason::Timeout),
                    descriptor: Some(descriptor),
                    colliding: Vec::new(),
                },
            }),
            // The holder is already running; it learns through watchdog.
            _ => {}
        }

        self.run_admission(&mut state);
    }

    /// Drive admission to a fixed point and deliver the outcomes.
    fn run_admission(&self, state: &mut SchedulerState) {
        let mut dead_ends = Vec::new();
        let admitted = verified::compute_admissions(&state.queue, |report| dead_ends.push(report));

        let now = now_unix_ms();
        for hash in admitted {
            let Some(index) = state.position(hash) else {
                continue;
            };
            let request = &mut state.queue[index];
            request.status = LockStatus::Running;
            request.timing.admitted_at_ms = Some(now);
            debug!(
                hash = %hash,
                key = %request.key,
                waited_ms = now.saturating_sub(request.timing.enqueued_at_ms),
                "lock admitted"
            );
            self.deliver_grant(state, hash);
        }

        for report in dead_ends {
            self.refuse_dead_end(state, report);
        }
    }

    fn deliver_grant(&self, state: &mut SchedulerState, hash: RequestHash) {
        match state.waiters.get_mut(&hash) {
            Some(Waiter::Local(slot)) => {
                if let Some(grant) = slot.take() {
                    // A dropped receiver means the caller was cancelled; its
                    // release guard unlocks the request.
                    let _ = grant.send(Ok(()));
                }
            }
            Some(Waiter::Remote(worker)) => {
                let worker = *worker;
                self.send(Outbound::Message {
                    to: worker,
                    message: MutexMessage::Continue {
                        hash,
                        rejected: None,
                        descriptor: None,
                        colliding: Vec::new(),
                    },
                });
            }
            None => warn!(hash = %hash, "admitted request has no waiter"),
        }
    }

    fn refuse_dead_end(&self, state: &mut SchedulerState, report: DeadEndReport) {
        let Some(index) = state.position(report.hash) else {
            return;
        };
        let descriptor = state.describe(index);
        warn!(
            hash = %report.hash,
            key = %descriptor.key_path(),
            blocker = %report.blocker,
            waiter = %report.waiter,
            "dead end detected, refusing lock"
        );
        if self.config.debug_dead_end {
            for participant in [report.hash, report.blocker, report.waiter] {
                if let Some(i) = state.position(participant) {
                    let d = state.describe(i);
                    warn!(hash = %participant, tree = ?d.tree, parents = ?d.parents, "dead end participant: {d}");
                }
            }
        }

        let colliding = report.colliding();
        match state.remove(report.hash).and_then(|(_, waiter)| waiter) {
            Some(Waiter::Local(Some(grant))) => {
                let _ = grant.send(Err(MutexError::DeadEndDetected {
                    descriptor: Box::new(descriptor),
                    colliding,
                }));
            }
            Some(Waiter::Remote(worker)) => self.send(Outbound::Message {
                to: worker,
                message: MutexMessage::Continue {
                    hash: report.hash,
                    rejected: Some(RejectReason::Exception),
                    descriptor: Some(descriptor),
                    colliding,
                },
            }),
            _ => {}
        }
    }

    fn send(&self, outbound: Outbound) {
        match &self.outbox {
            Some(outbox) => {
                if outbox.send(outbound).is_err() {
                    warn!("coordinator outbox closed, dropping outbound message");
                }
            }
            None => warn!(?outbound, "remote delivery requested on a local scheduler"),
        }
    }
}
