//! Worker side of a cluster: a synchronizer that forwards to the coordinator.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use nestlock_protocol::LockDescriptor;
use nestlock_protocol::MutexMessage;
use nestlock_protocol::PROTOCOL_VERSION;
use nestlock_protocol::RejectReason;
use nestlock_protocol::RequestHash;
use nestlock_protocol::WorkerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::MutexConfig;
use crate::error::MutexError;
use crate::scheduler::Synchronizer;
use crate::scheduler::watchdog_verdict;
use crate::transport::WorkerTransport;
use crate::types::LockRequest;

type Reply = oneshot::Sender<Option<LockDescriptor>>;

/// Callers suspended on a coordinator reply.
#[derive(Debug, Default)]
struct PendingReplies {
    grants: HashMap<RequestHash, oneshot::Sender<Result<(), MutexError>>>,
    watchdogs: HashMap<RequestHash, VecDeque<Reply>>,
    infos: HashMap<RequestHash, VecDeque<Reply>>,
}

impl PendingReplies {
    fn is_empty(&self) -> bool {
        self.grants.is_empty() && self.watchdogs.is_empty() && self.infos.is_empty()
    }
}

fn watchdog_replies(pending: &mut PendingReplies) -> &mut HashMap<RequestHash, VecDeque<Reply>> {
    &mut pending.watchdogs
}

fn info_replies(pending: &mut PendingReplies) -> &mut HashMap<RequestHash, VecDeque<Reply>> {
    &mut pending.infos
}

fn pop_reply(map: &mut HashMap<RequestHash, VecDeque<Reply>>, hash: RequestHash) -> Option<Reply> {
    let queue = map.get_mut(&hash)?;
    let reply = queue.pop_front();
    if queue.is_empty() {
        map.remove(&hash);
    }
    reply
}

/// Synchronizer for a worker process; the queue lives in the coordinator.
#[derive(Debug)]
pub struct WorkerSynchronizer {
    transport: Arc<dyn WorkerTransport>,
    config: MutexConfig,
    pending: Arc<Mutex<PendingReplies>>,
    dispatch: AbortHandle,
}

impl WorkerSynchronizer {
    /// Perform the `VERIFY` handshake and start dispatching coordinator
    /// messages.
    ///
    /// Fails with `CoordinatorNotInitialized` if no `VERIFY_COMPLETE` arrives
    /// within the configured handshake timeout, `VersionMismatch` if the
    /// coordinator reports another protocol version, and
    /// `ConfigurationMismatch` if exactly one side uses custom configuration.
    pub async fn connect(transport: Arc<dyn WorkerTransport>, config: MutexConfig) -> Result<Self, MutexError> {
        let config = config.validate()?;
        let worker = transport.worker_id();
        let mut inbound = transport.subscribe().await.map_err(MutexError::transport)?;

        transport
            .send_to_coordinator(MutexMessage::Verify {
                version: PROTOCOL_VERSION.to_string(),
            })
            .await
            .map_err(MutexError::transport)?;

        let started = Instant::now();
        let (version, uses_custom_config) =
            match tokio::time::timeout(config.handshake_timeout(), await_verify_complete(&mut inbound)).await {
                Ok(Some(reply)) => reply,
                Ok(None) | Err(_) => {
                    return Err(MutexError::CoordinatorNotInitialized {
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            };

        if version != PROTOCOL_VERSION {
            return Err(MutexError::VersionMismatch {
                local: PROTOCOL_VERSION.to_string(),
                remote: version,
            });
        }
        if uses_custom_config != config.is_customized() {
            return Err(MutexError::ConfigurationMismatch {
                local: config.is_customized(),
                remote: uses_custom_config,
            });
        }

        info!(worker = %worker, version = %version, "connected to mutex coordinator");

        let pending = Arc::new(Mutex::new(PendingReplies::default()));
        let dispatch = tokio::spawn(dispatch(worker, inbound, pending.clone())).abort_handle();

        Ok(Self {
            transport,
            config,
            pending,
            dispatch,
        })
    }

    /// This worker's identity.
    pub fn worker_id(&self) -> WorkerId {
        self.transport.worker_id()
    }

    async fn send(&self, message: MutexMessage) -> Result<(), MutexError> {
        self.transport.send_to_coordinator(message).await.map_err(MutexError::transport)
    }

    async fn request_descriptor(
        &self,
        hash: RequestHash,
        message: MutexMessage,
        select: fn(&mut PendingReplies) -> &mut HashMap<RequestHash, VecDeque<Reply>>,
    ) -> Result<Option<LockDescriptor>, MutexError> {
        let (tx, rx) = oneshot::channel();
        select(&mut *self.pending.lock()).entry(hash).or_default().push_back(tx);
        self.send(message).await?;
        rx.await.map_err(|_| MutexError::Disconnected { hash })
    }
}

impl Drop for WorkerSynchronizer {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

async fn await_verify_complete(inbound: &mut mpsc::UnboundedReceiver<MutexMessage>) -> Option<(String, bool)> {
    while let Some(message) = inbound.recv().await {
        match message {
            MutexMessage::VerifyComplete {
                version,
                uses_custom_config,
            } => return Some((version, uses_custom_config)),
            other => warn!(action = other.action(), "message before handshake completed, ignoring"),
        }
    }
    None
}

/// Turn a `CONTINUE` into the caller's outcome.
fn grant_outcome(
    hash: RequestHash,
    rejected: Option<RejectReason>,
    descriptor: Option<LockDescriptor>,
    colliding: Vec<RequestHash>,
) -> Result<(), MutexError> {
    let Some(reason) = rejected else {
        return Ok(());
    };
    let Some(descriptor) = descriptor else {
        return Err(MutexError::Transport {
            reason: format!("rejection of {hash} arrived without a descriptor"),
        });
    };
    let descriptor = Box::new(descriptor);
    match reason {
        RejectReason::Timeout => Err(MutexError::LockTimeout { descriptor }),
        RejectReason::Exception => Err(MutexError::DeadEndDetected { descriptor, colliding }),
    }
}

async fn dispatch(
    worker: WorkerId,
    mut inbound: mpsc::UnboundedReceiver<MutexMessage>,
    pending: Arc<Mutex<PendingReplies>>,
) {
    while let Some(message) = inbound.recv().await {
        match message {
            MutexMessage::Continue {
                hash,
                rejected,
                descriptor,
                colliding,
            } => {
                let Some(grant) = pending.lock().grants.remove(&hash) else {
                    debug!(worker = %worker, hash = %hash, "continue for a request nobody waits on");
                    continue;
                };
                let _ = grant.send(grant_outcome(hash, rejected, descriptor, colliding));
            }
            MutexMessage::WatchdogStatus { hash, descriptor } => {
                if let Some(reply) = pop_reply(watchdog_replies(&mut pending.lock()), hash) {
                    let _ = reply.send(descriptor);
                }
            }
            MutexMessage::LockInfoReply { hash, descriptor } => {
                if let Some(reply) = pop_reply(info_replies(&mut pending.lock()), hash) {
                    let _ = reply.send(descriptor);
                }
            }
            other => warn!(worker = %worker, action = other.action(), "unexpected message at worker"),
        }
    }

    // Coordinator gone: wake everybody.
    let mut pending = pending.lock();
    let stranded = pending.grants.len();
    for (hash, grant) in pending.grants.drain() {
        let _ = grant.send(Err(MutexError::Disconnected { hash }));
    }
    pending.watchdogs.clear();
    pending.infos.clear();
    warn!(worker = %worker, stranded, "coordinator connection closed");
}

#[async_trait]
impl Synchronizer for WorkerSynchronizer {
    async fn lock(&self, request: LockRequest) -> Result<(), MutexError> {
        let hash = request.hash;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().grants.insert(hash, tx);

        let message = MutexMessage::Lock {
            hash,
            key: request.key.segments().to_vec(),
            single_access: request.single_access,
            max_locking_time_ms: request.max_locking_time_ms(),
            parents: request.parents,
            tree: request.tree,
            call_site: request.call_site,
        };
        if let Err(error) = self.send(message).await {
            self.pending.lock().grants.remove(&hash);
            return Err(error);
        }

        rx.await.map_err(|_| MutexError::Disconnected { hash })?
    }

    async fn unlock(&self, hash: RequestHash) -> Result<(), MutexError> {
        // A caller cancelled while waiting never reads its grant.
        self.pending.lock().grants.remove(&hash);
        self.send(MutexMessage::Unlock { hash }).await
    }

    async fn watchdog(&self, hash: RequestHash, phase: &str) -> Result<(), MutexError> {
        let message = MutexMessage::WatchdogReport {
            hash,
            phase: phase.to_string(),
        };
        let descriptor = self.request_descriptor(hash, message, watchdog_replies).await?;
        watchdog_verdict(hash, phase, descriptor)
    }

    async fn get_lock_info(&self, hash: RequestHash) -> Result<Option<LockDescriptor>, MutexError> {
        self.request_descriptor(hash, MutexMessage::LockInfo { hash }, info_replies).await
    }

    fn is_clear(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn config(&self) -> &MutexConfig {
        &self.config
    }
}
