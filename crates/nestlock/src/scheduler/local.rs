//! In-process synchronizer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::Synchronizer;
use super::engine::Scheduler;
use super::engine::Waiter;
use super::watchdog_verdict;
use crate::config::MutexConfig;
use crate::error::MutexError;
use crate::timeout::TimeoutHandler;
use crate::types::LockDescriptor;
use crate::types::LockRequest;
use crate::types::RequestHash;

/// Synchronizer whose queue lives in this process.
///
/// Cheap to clone; all clones share one scheduler.
#[derive(Debug, Clone)]
pub struct LocalSynchronizer {
    scheduler: Arc<Scheduler>,
}

impl LocalSynchronizer {
    /// Create a synchronizer with the default timeout handler.
    pub fn new(config: MutexConfig) -> Result<Self, MutexError> {
        Ok(Self {
            scheduler: Scheduler::new(config.validate()?, None, None),
        })
    }

    /// Create a synchronizer with a custom timeout handler.
    pub fn with_timeout_handler(config: MutexConfig, handler: Arc<dyn TimeoutHandler>) -> Result<Self, MutexError> {
        Ok(Self {
            scheduler: Scheduler::new(config.validate()?, Some(handler), None),
        })
    }

    pub(crate) fn from_scheduler(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

impl Default for LocalSynchronizer {
    fn default() -> Self {
        Self::from_scheduler(Scheduler::new(MutexConfig::default(), None, None))
    }
}

#[async_trait]
impl Synchronizer for LocalSynchronizer {
    async fn lock(&self, request: LockRequest) -> Result<(), MutexError> {
        let hash = request.hash;
        let (tx, rx) = oneshot::channel();
        self.scheduler.enqueue(request, Waiter::Local(Some(tx)));
        rx.await.map_err(|_| MutexError::Disconnected { hash })?
    }

    async fn unlock(&self, hash: RequestHash) -> Result<(), MutexError> {
        self.scheduler.release(hash);
        Ok(())
    }

    async fn watchdog(&self, hash: RequestHash, phase: &str) -> Result<(), MutexError> {
        watchdog_verdict(hash, phase, self.scheduler.record_phase(hash, phase))
    }

    async fn get_lock_info(&self, hash: RequestHash) -> Result<Option<LockDescriptor>, MutexError> {
        Ok(self.scheduler.lock_info(hash))
    }

    fn is_clear(&self) -> bool {
        self.scheduler.is_clear()
    }

    fn config(&self) -> &MutexConfig {
        self.scheduler.config()
    }
}
