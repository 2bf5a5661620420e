//! Cluster variant: one coordinator owns the queue, workers forward to it.
//!
//! Workers handshake with `VERIFY` before their first lock and then exchange
//! `LOCK`/`UNLOCK`/`CONTINUE` and the watchdog and lock-info message pairs
//! over a [`crate::transport`] implementation. A worker that exits or is
//! terminated loses every request it owned.

mod coordinator;
mod worker;

pub use coordinator::Coordinator;
pub use coordinator::CoordinatorHandle;
pub use worker::WorkerSynchronizer;
