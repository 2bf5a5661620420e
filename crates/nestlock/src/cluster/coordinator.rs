//! Coordinator process glue.
//!
//! One event loop owns the inbound stream, so messages are applied to the
//! scheduler one at a time in arrival order. Everything the scheduler wants
//! to send (grants, rejections, replies, terminations) goes through a single
//! outbox drained by a forwarding task, which keeps per-worker delivery
//! ordered.

use std::sync::Arc;
use std::time::Duration;

use nestlock_protocol::MutexMessage;
use nestlock_protocol::PROTOCOL_VERSION;
use nestlock_protocol::WorkerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::MutexConfig;
use crate::error::MutexError;
use crate::executor::MutexExecutor;
use crate::key::LockKey;
use crate::scheduler::LocalSynchronizer;
use crate::scheduler::Outbound;
use crate::scheduler::Scheduler;
use crate::scheduler::Waiter;
use crate::timeout::TimeoutHandler;
use crate::transport::CoordinatorEvent;
use crate::transport::CoordinatorTransport;
use crate::types::LockRequest;

/// Builder for the coordinator side of a cluster.
#[derive(Debug, Default)]
pub struct Coordinator {
    config: MutexConfig,
    timeout_handler: Option<Arc<dyn TimeoutHandler>>,
}

impl Coordinator {
    /// Coordinator with the given configuration and the default timeout
    /// handler.
    pub fn new(config: MutexConfig) -> Self {
        Self {
            config,
            timeout_handler: None,
        }
    }

    /// Replace the timeout handler.
    pub fn with_timeout_handler(mut self, handler: Arc<dyn TimeoutHandler>) -> Self {
        self.timeout_handler = Some(handler);
        self
    }

    /// Subscribe to the transport and start serving workers.
    pub async fn start<T>(self, transport: Arc<T>) -> Result<CoordinatorHandle, MutexError>
    where T: CoordinatorTransport + ?Sized + 'static {
        let config = self.config.validate()?;
        let events = transport.subscribe().await.map_err(MutexError::transport)?;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(config, self.timeout_handler, Some(outbox.clone()));
        let cancel = CancellationToken::new();

        let forwarder = tokio::spawn(forward_outbox(transport, outbox_rx, cancel.clone()));
        let event_loop = tokio::spawn(run_event_loop(scheduler.clone(), events, outbox, cancel.clone()));

        info!(
            version = PROTOCOL_VERSION,
            customized = scheduler.config().is_customized(),
            "mutex coordinator started"
        );

        Ok(CoordinatorHandle {
            synchronizer: LocalSynchronizer::from_scheduler(scheduler),
            cancel,
            tasks: vec![event_loop, forwarder],
        })
    }
}

/// A running coordinator.
#[derive(Debug)]
pub struct CoordinatorHandle {
    synchronizer: LocalSynchronizer,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Synchronizer over the coordinator's own queue, for locks taken inside
    /// the coordinator process.
    pub fn synchronizer(&self) -> LocalSynchronizer {
        self.synchronizer.clone()
    }

    /// Executor bound to the coordinator's queue.
    pub fn executor(&self) -> MutexExecutor {
        MutexExecutor::new(Arc::new(self.synchronizer.clone()))
    }

    /// The scheduler owning the cluster queue.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.synchronizer.scheduler()
    }

    /// Stop serving and wait for the background tasks to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(error) = task.await {
                warn!(error = %error, "coordinator task ended abnormally");
            }
        }
        info!(clear = self.synchronizer.scheduler().is_clear(), "mutex coordinator stopped");
    }

    /// Wait until the queue is empty, polling every `interval`. Returns false
    /// if `limit` elapsed first.
    pub async fn wait_clear(&self, interval: Duration, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while !self.synchronizer.scheduler().is_clear() {
                tokio::time::sleep(interval).await;
            }
        })
        .await
        .is_ok()
    }
}

async fn run_event_loop(
    scheduler: Arc<Scheduler>,
    mut events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    outbox: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("coordinator transport closed");
                    break;
                }
            },
        };

        match event {
            CoordinatorEvent::Message { from, message } => handle_message(&scheduler, &outbox, from, message),
            CoordinatorEvent::WorkerExited { worker } => {
                let dropped = scheduler.drop_worker(worker);
                debug!(worker = %worker, dropped, "worker exited");
            }
        }
    }
}

fn handle_message(
    scheduler: &Arc<Scheduler>,
    outbox: &mpsc::UnboundedSender<Outbound>,
    from: WorkerId,
    message: MutexMessage,
) {
    let reply = |message: MutexMessage| {
        if outbox.send(Outbound::Message { to: from, message }).is_err() {
            warn!(worker = %from, "coordinator outbox closed, dropping reply");
        }
    };

    match message {
        MutexMessage::Verify { version } => {
            if version != PROTOCOL_VERSION {
                warn!(worker = %from, remote = %version, local = PROTOCOL_VERSION, "worker speaks a different protocol version");
            }
            reply(MutexMessage::VerifyComplete {
                version: PROTOCOL_VERSION.to_string(),
                uses_custom_config: scheduler.config().is_customized(),
            });
        }
        MutexMessage::Lock {
            hash,
            key,
            single_access,
            max_locking_time_ms,
            parents,
            tree,
            call_site,
        } => {
            let mut request = LockRequest::new(LockKey::from_segments(key), single_access)
                .with_max_locking_time(max_locking_time_ms.map(Duration::from_millis))
                .with_parents(parents)
                .with_tree(tree);
            request.hash = hash;
            request.call_site = call_site;
            scheduler.enqueue(request, Waiter::Remote(from));
        }
        MutexMessage::Unlock { hash } => {
            scheduler.release(hash);
        }
        MutexMessage::WatchdogReport { hash, phase } => {
            let descriptor = scheduler.record_phase(hash, &phase);
            reply(MutexMessage::WatchdogStatus { hash, descriptor });
        }
        MutexMessage::LockInfo { hash } => {
            reply(MutexMessage::LockInfoReply {
                hash,
                descriptor: scheduler.lock_info(hash),
            });
        }
        other => warn!(worker = %from, action = other.action(), "unexpected message at coordinator"),
    }
}

async fn forward_outbox<T>(transport: Arc<T>, mut outbox: mpsc::UnboundedReceiver<Outbound>, cancel: CancellationToken)
where T: CoordinatorTransport + ?Sized + 'static {
    loop {
        let outbound = tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = outbox.recv() => match outbound {
                Some(outbound) => outbound,
                None => break,
            },
        };

        match outbound {
            Outbound::Message { to, message } => {
                let action = message.action();
                if let Err(error) = transport.send_to_worker(to, message).await {
                    warn!(worker = %to, action, error = %format!("{error:#}"), "failed to deliver message");
                }
            }
            Outbound::Terminate { worker } => {
                if let Err(error) = transport.terminate_worker(worker).await {
                    warn!(worker = %worker, error = %format!("{error:#}"), "failed to terminate worker");
                }
            }
        }
    }
}
