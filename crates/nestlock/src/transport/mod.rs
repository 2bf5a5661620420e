//! Message transport between the coordinator and its workers.
//!
//! The cluster glue only needs ordered, reliable, bidirectional delivery of
//! [`MutexMessage`]s plus a notification when a worker goes away. Any channel
//! with those properties (IPC pipes, a socket per worker, in-memory queues)
//! can back these traits.
//!
//! [`MemoryNetwork`] is the in-process implementation used by tests and by
//! embedders that run "workers" as tasks.

mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
pub use memory::MemoryCoordinatorTransport;
pub use memory::MemoryNetwork;
pub use memory::MemoryWorkerTransport;
use nestlock_protocol::MutexMessage;
use nestlock_protocol::WorkerId;
use tokio::sync::mpsc;

/// Something that happened on the coordinator side of the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A worker sent a message.
    Message {
        /// Sender.
        from: WorkerId,
        /// Decoded message.
        message: MutexMessage,
    },
    /// A worker exited or was terminated.
    WorkerExited {
        /// The departed worker.
        worker: WorkerId,
    },
}

/// Coordinator end of the transport.
#[async_trait]
pub trait CoordinatorTransport: Send + Sync + Debug {
    /// Take the inbound event stream. Only one subscriber is supported.
    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<CoordinatorEvent>>;

    /// Deliver a message to one worker.
    async fn send_to_worker(&self, worker: WorkerId, message: MutexMessage) -> anyhow::Result<()>;

    /// Terminate a worker. Must eventually produce a
    /// [`CoordinatorEvent::WorkerExited`] for it.
    async fn terminate_worker(&self, worker: WorkerId) -> anyhow::Result<()>;
}

/// Worker end of the transport.
#[async_trait]
pub trait WorkerTransport: Send + Sync + Debug {
    /// This worker's identity as seen by the coordinator.
    fn worker_id(&self) -> WorkerId;

    /// Take the stream of messages from the coordinator. The stream ends when
    /// the coordinator goes away or this worker is terminated.
    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<MutexMessage>>;

    /// Deliver a message to the coordinator.
    async fn send_to_coordinator(&self, message: MutexMessage) -> anyhow::Result<()>;
}
