//! Client executor: wraps a body in a lock on a hierarchical key.
//!
//! ```ignore
//! let executor = MutexExecutor::local(MutexConfig::default())?;
//! executor
//!     .lock_single_access("root", None, || async {
//!         // Nested related locks of the same chain are admitted through
//!         // their parent instead of deadlocking on it.
//!         executor.lock_single_access("root/child", None, || async { Ok::<_, MutexError>(()) }).await
//!     })
//!     .await?;
//! ```

mod context;
mod registry;

use std::backtrace::Backtrace;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use context::LockStack;
pub use context::StackEntry;
pub use context::detached;
pub use registry::LockRegistry;
use tracing::debug;
use tracing::warn;

use crate::config::MutexConfig;
use crate::error::MutexError;
use crate::key::LockKey;
use crate::scheduler::LocalSynchronizer;
use crate::scheduler::Synchronizer;
use crate::types::ExecutorId;
use crate::types::LockDescriptor;
use crate::types::LockRequest;
use crate::types::RequestHash;

/// Issues lock requests on behalf of call chains.
///
/// Clones share identity, registry and synchronizer, so a clone captured in a
/// body nests under the scopes opened by the original.
#[derive(Debug, Clone)]
pub struct MutexExecutor {
    id: ExecutorId,
    synchronizer: Arc<dyn Synchronizer>,
    registry: Arc<LockRegistry>,
    precheck: bool,
}

impl MutexExecutor {
    /// Executor over any synchronizer, with its own registry.
    pub fn new(synchronizer: Arc<dyn Synchronizer>) -> Self {
        Self {
            id: ExecutorId::next(),
            synchronizer,
            registry: Arc::new(LockRegistry::new()),
            precheck: true,
        }
    }

    /// Executor over a fresh in-process synchronizer.
    pub fn local(config: MutexConfig) -> Result<Self, MutexError> {
        Ok(Self::new(Arc::new(LocalSynchronizer::new(config)?)))
    }

    /// Share a registry with other executors of the process.
    pub fn with_registry(mut self, registry: Arc<LockRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Toggle the local dead-end check made before contacting the scheduler.
    pub fn with_precheck(mut self, enabled: bool) -> Self {
        self.precheck = enabled;
        self
    }

    pub fn id(&self) -> ExecutorId {
        self.id
    }

    pub fn synchronizer(&self) -> &Arc<dyn Synchronizer> {
        &self.synchronizer
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    /// Run `body` while holding `key` exclusively.
    pub async fn lock_single_access<K, F, Fut, T, E>(
        &self,
        key: K,
        max_locking_time: Option<Duration>,
        body: F,
    ) -> Result<T, E>
    where
        K: Into<LockKey>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<MutexError>,
    {
        self.lock_access(key, true, max_locking_time, body).await
    }

    /// Run `body` while holding `key` shared.
    pub async fn lock_multi_access<K, F, Fut, T, E>(
        &self,
        key: K,
        max_locking_time: Option<Duration>,
        body: F,
    ) -> Result<T, E>
    where
        K: Into<LockKey>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<MutexError>,
    {
        self.lock_access(key, false, max_locking_time, body).await
    }

    /// Run `body` while holding `key`.
    ///
    /// The lock is released on every exit path: normal return, body error,
    /// and cancellation of the returned future. `max_locking_time` falls back
    /// to the configured default. A body error is returned as is after the
    /// unlock; an unlock failure is only reported when the body succeeded.
    pub async fn lock_access<K, F, Fut, T, E>(
        &self,
        key: K,
        single_access: bool,
        max_locking_time: Option<Duration>,
        body: F,
    ) -> Result<T, E>
    where
        K: Into<LockKey>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<MutexError>,
    {
        let request = self.prepare(key.into(), single_access, max_locking_time);
        let hash = request.hash;
        let entry = StackEntry {
            hash,
            key: request.key.clone(),
            single_access,
            executor: self.id,
        };

        if self.precheck {
            if let Some(report) = self.registry.check_dead_end(self.id, &request) {
                warn!(hash = %hash, key = %request.key, blocker = %report.blocker, waiter = %report.waiter, "dead end detected before enqueue");
                let blocked_by = vec![report.blocker];
                return Err(MutexError::DeadEndDetected {
                    descriptor: Box::new(request.descriptor(blocked_by, None)),
                    colliding: report.colliding(),
                }
                .into());
            }
        }

        self.registry.insert(self.id, request.clone());
        let guard = ReleaseGuard {
            hash,
            executor: self.id,
            synchronizer: self.synchronizer.clone(),
            registry: self.registry.clone(),
            armed: true,
        };

        if let Err(error) = self.synchronizer.lock(request).await {
            // Clears a timed-out tombstone; otherwise a no-op.
            if let Err(unlock_error) = guard.release().await {
                debug!(hash = %hash, error = %unlock_error, "unlock after failed lock");
            }
            return Err(error.into());
        }
        self.registry.mark_running(self.id, hash);

        let result = context::with_entry(entry, body()).await;
        let released = guard.release().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error.into()),
            (Err(error), released) => {
                if let Err(unlock_error) = released {
                    warn!(hash = %hash, error = %unlock_error, "unlock failed after body error");
                }
                Err(error)
            }
        }
    }

    /// Record a phase checkpoint for the innermost scope of this executor.
    ///
    /// Fails with `WatchdogRejection` once that scope's request timed out.
    pub async fn watchdog(&self, phase: &str) -> Result<(), MutexError> {
        let hash = self.current_hash().ok_or(MutexError::NotInLockedScope)?;
        self.synchronizer.watchdog(hash, phase).await
    }

    /// Request held by the innermost scope of this executor.
    pub fn current_hash(&self) -> Option<RequestHash> {
        LockStack::current().innermost(self.id).map(|e| e.hash)
    }

    /// The calling chain's lock stack.
    pub fn current_stack(&self) -> LockStack {
        LockStack::current()
    }

    pub async fn get_lock_info(&self, hash: RequestHash) -> Result<Option<LockDescriptor>, MutexError> {
        self.synchronizer.get_lock_info(hash).await
    }

    /// True iff nothing is queued or waiting, and this executor tracks no
    /// request.
    pub fn is_clear(&self) -> bool {
        self.synchronizer.is_clear() && self.registry.in_flight(self.id) == 0
    }

    fn prepare(&self, key: LockKey, single_access: bool, max_locking_time: Option<Duration>) -> LockRequest {
        let config = self.synchronizer.config();
        let stack = LockStack::current();
        let parents = stack.parents_for(self.id, &key);
        let tree = stack.tree_for(self.id);

        let mut request = LockRequest::new(key, single_access)
            .with_max_locking_time(max_locking_time.or_else(|| config.default_max_locking_time()))
            .with_parents(parents)
            .with_tree(tree);
        request.owning_chain = Some(self.id);
        if config.debug_stacks {
            request.call_site = Some(Backtrace::force_capture().to_string());
        }
        request
    }
}

/// Releases a request when the locked scope ends, including by cancellation.
struct ReleaseGuard {
    hash: RequestHash,
    executor: ExecutorId,
    synchronizer: Arc<dyn Synchronizer>,
    registry: Arc<LockRegistry>,
    armed: bool,
}

impl ReleaseGuard {
    async fn release(mut self) -> Result<(), MutexError> {
        self.armed = false;
        self.registry.remove(self.executor, self.hash);
        self.synchronizer.unlock(self.hash).await
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.registry.remove(self.executor, self.hash);
        let hash = self.hash;
        let synchronizer = self.synchronizer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(hash = %hash, "locked scope cancelled, releasing");
                runtime.spawn(async move {
                    if let Err(error) = synchronizer.unlock(hash).await {
                        warn!(hash = %hash, error = %error, "release after cancellation failed");
                    }
                });
            }
            Err(_) => warn!(hash = %hash, "locked scope dropped outside a runtime, lock leaked"),
        }
    }
}
