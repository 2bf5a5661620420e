//! In-memory transport.
//!
//! Every message is pushed through the JSON codec on its way, so anything
//! that works here also works over a byte-oriented channel.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use anyhow::bail;
use async_trait::async_trait;
use nestlock_protocol::MutexMessage;
use nestlock_protocol::WorkerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;

use super::CoordinatorEvent;
use super::CoordinatorTransport;
use super::WorkerTransport;

fn through_codec(message: &MutexMessage) -> anyhow::Result<MutexMessage> {
    let bytes = nestlock_protocol::encode(message).with_context(|| format!("encode {}", message.action()))?;
    nestlock_protocol::decode(&bytes).context("decode message")
}

#[derive(Debug)]
struct WorkerSlot {
    /// `None` once the worker exited or was terminated.
    sender: Option<mpsc::UnboundedSender<MutexMessage>>,
    receiver: Option<mpsc::UnboundedReceiver<MutexMessage>>,
}

#[derive(Debug)]
struct NetworkState {
    next_worker: u32,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    event_receiver: Option<mpsc::UnboundedReceiver<CoordinatorEvent>>,
    workers: HashMap<WorkerId, WorkerSlot>,
}

impl NetworkState {
    /// Close a worker's channel and announce its departure. Returns false if
    /// it was already gone.
    fn disconnect(&mut self, worker: WorkerId) -> bool {
        let Some(slot) = self.workers.get_mut(&worker) else {
            return false;
        };
        if slot.sender.take().is_none() {
            return false;
        }
        // The coordinator may already be gone; nothing to announce then.
        let _ = self.events.send(CoordinatorEvent::WorkerExited { worker });
        true
    }
}

/// An in-process network of one coordinator and any number of workers.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        let (events, event_receiver) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                next_worker: 1,
                events,
                event_receiver: Some(event_receiver),
                workers: HashMap::new(),
            })),
        }
    }

    /// The coordinator end.
    pub fn coordinator(&self) -> MemoryCoordinatorTransport {
        MemoryCoordinatorTransport { network: self.clone() }
    }

    /// Register a new worker and return its end.
    pub fn spawn_worker(&self) -> MemoryWorkerTransport {
        let mut state = self.state.lock();
        let id = WorkerId(state.next_worker);
        state.next_worker += 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.workers.insert(id, WorkerSlot {
            sender: Some(sender),
            receiver: Some(receiver),
        });
        debug!(worker = %id, "worker attached");
        MemoryWorkerTransport {
            network: self.clone(),
            id,
        }
    }

    /// Whether the worker exited or was terminated.
    pub fn is_terminated(&self, worker: WorkerId) -> bool {
        self.state.lock().workers.get(&worker).is_none_or(|slot| slot.sender.is_none())
    }

    /// Number of workers still attached.
    pub fn live_workers(&self) -> usize {
        self.state.lock().workers.values().filter(|slot| slot.sender.is_some()).count()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator end of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryCoordinatorTransport {
    network: MemoryNetwork,
}

#[async_trait]
impl CoordinatorTransport for MemoryCoordinatorTransport {
    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<CoordinatorEvent>> {
        self.network.state.lock().event_receiver.take().context("coordinator events already subscribed")
    }

    async fn send_to_worker(&self, worker: WorkerId, message: MutexMessage) -> anyhow::Result<()> {
        let message = through_codec(&message)?;
        let state = self.network.state.lock();
        let Some(sender) = state.workers.get(&worker).and_then(|slot| slot.sender.as_ref()) else {
            bail!("{worker} is not connected");
        };
        sender.send(message).map_err(|_| anyhow::anyhow!("{worker} stopped listening"))
    }

    async fn terminate_worker(&self, worker: WorkerId) -> anyhow::Result<()> {
        if self.network.state.lock().disconnect(worker) {
            info!(worker = %worker, "worker terminated");
        }
        Ok(())
    }
}

/// Worker end of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryWorkerTransport {
    network: MemoryNetwork,
    id: WorkerId,
}

impl MemoryWorkerTransport {
    /// Leave the network, as a worker process exiting would.
    pub fn exit(&self) {
        if self.network.state.lock().disconnect(self.id) {
            debug!(worker = %self.id, "worker exited");
        }
    }
}

#[async_trait]
impl WorkerTransport for MemoryWorkerTransport {
    fn worker_id(&self) -> WorkerId {
        self.id
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<MutexMessage>> {
        let mut state = self.network.state.lock();
        let slot = state.workers.get_mut(&self.id).context("worker not registered")?;
        slot.receiver.take().with_context(|| format!("{} already subscribed", self.id))
    }

    async fn send_to_coordinator(&self, message: MutexMessage) -> anyhow::Result<()> {
        let message = through_codec(&message)?;
        let state = self.network.state.lock();
        if state.workers.get(&self.id).is_none_or(|slot| slot.sender.is_none()) {
            bail!("{} is disconnected", self.id);
        }
        state
            .events
            .send(CoordinatorEvent::Message { from: self.id, message })
            .map_err(|_| anyhow::anyhow!("coordinator stopped listening"))
    }
}
