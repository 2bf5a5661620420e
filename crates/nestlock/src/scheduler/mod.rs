//! Lock scheduling.
//!
//! A [`Scheduler`] owns the queue of one authority domain and drives the pure
//! admission functions in [`crate::verified`] to a fixed point on every change.
//! Callers reach it through the [`Synchronizer`] contract, which has two
//! implementations:
//!
//! - [`LocalSynchronizer`]: the queue lives in this process
//! - [`WorkerSynchronizer`](crate::cluster::WorkerSynchronizer): requests are
//!   forwarded to the coordinator process that owns the queue

mod engine;
mod local;

use std::fmt;

use async_trait::async_trait;
pub use engine::Scheduler;
pub(crate) use engine::Outbound;
pub(crate) use engine::Waiter;
pub use local::LocalSynchronizer;

use crate::config::MutexConfig;
use crate::error::MutexError;
use crate::types::LockDescriptor;
use crate::types::LockRequest;
use crate::types::LockStatus;
use crate::types::RequestHash;

/// Contract between the executor and whatever owns the queue.
#[async_trait]
pub trait Synchronizer: Send + Sync + fmt::Debug {
    /// Enqueue `request` and suspend until it is admitted.
    ///
    /// Fails with `LockTimeout` or `DeadEndDetected` when the scheduler forces
    /// the request out instead of admitting it.
    async fn lock(&self, request: LockRequest) -> Result<(), MutexError>;

    /// Release a request, pending or running. Unknown hashes are ignored.
    async fn unlock(&self, hash: RequestHash) -> Result<(), MutexError>;

    /// Record a phase checkpoint; fails if the request already timed out.
    async fn watchdog(&self, hash: RequestHash, phase: &str) -> Result<(), MutexError>;

    /// Snapshot of a request and of what currently blocks it.
    async fn get_lock_info(&self, hash: RequestHash) -> Result<Option<LockDescriptor>, MutexError>;

    /// True iff no request and no suspended caller is left.
    fn is_clear(&self) -> bool;

    /// Configuration in effect.
    fn config(&self) -> &MutexConfig;
}

/// Turn the scheduler's view of a request into the watchdog outcome.
pub(crate) fn watchdog_verdict(
    hash: RequestHash,
    phase: &str,
    descriptor: Option<LockDescriptor>,
) -> Result<(), MutexError> {
    match descriptor {
        None => Err(MutexError::LockNotFound { hash }),
        Some(descriptor) if descriptor.status == LockStatus::Timeouted => Err(MutexError::WatchdogRejection {
            phase: phase.to_string(),
            descriptor: Box::new(descriptor),
        }),
        Some(_) => Ok(()),
    }
}
