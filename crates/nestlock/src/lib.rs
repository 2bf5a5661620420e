//! Hierarchical mutexes coordinated across processes.
//!
//! Locks are taken on `/`-separated keys. Two keys conflict only when one is
//! a prefix of the other, so `root` and `root/child` exclude each other while
//! `root/a` and `root/b` do not. Each lock is exclusive (single access) or
//! shared (multi access).
//!
//! - [`MutexExecutor`] - wraps a body in a lock; nested related locks of the
//!   same call chain are admitted through their enclosing lock
//! - [`LocalSynchronizer`] - the queue lives in this process
//! - [`Coordinator`] / [`WorkerSynchronizer`] - the queue lives in one
//!   coordinator process and workers forward over a [`transport`]
//! - [`verified`] - the pure admission and dead-end functions
//!
//! Requests that can provably never be admitted fail with
//! [`MutexError::DeadEndDetected`]; requests held past their maximum locking
//! time are handled by a [`TimeoutHandler`].
//!
//! ## Example
//!
//! ```ignore
//! use nestlock::{MutexConfig, MutexError, MutexExecutor};
//!
//! let executor = MutexExecutor::local(MutexConfig::default())?;
//! let total = executor
//!     .lock_single_access("accounts/42", Some(Duration::from_secs(5)), || async {
//!         executor.watchdog("loaded").await?;
//!         Ok::<_, MutexError>(100)
//!     })
//!     .await?;
//! ```
//!
//! ## Cluster Example
//!
//! ```ignore
//! use nestlock::{Coordinator, MemoryNetwork, MutexConfig, MutexExecutor, WorkerSynchronizer};
//!
//! let network = MemoryNetwork::new();
//! let coordinator = Coordinator::new(MutexConfig::default()).start(Arc::new(network.coordinator())).await?;
//!
//! let worker = WorkerSynchronizer::connect(Arc::new(network.spawn_worker()), MutexConfig::default()).await?;
//! let executor = MutexExecutor::new(Arc::new(worker));
//! executor.lock_multi_access("reports", None, || async { Ok::<_, MutexError>(()) }).await?;
//!
//! coordinator.shutdown().await;
//! ```

pub mod cluster;
mod config;
pub mod constants;
mod error;
pub mod executor;
mod key;
mod safe_callback;
pub mod scheduler;
mod timeout;
pub mod transport;
mod types;
pub mod verified;

pub use cluster::Coordinator;
pub use cluster::CoordinatorHandle;
pub use cluster::WorkerSynchronizer;
pub use config::MutexConfig;
pub use error::MutexError;
pub use executor::LockRegistry;
pub use executor::LockStack;
pub use executor::MutexExecutor;
pub use executor::StackEntry;
pub use key::LockKey;
pub use nestlock_protocol::MutexMessage;
pub use nestlock_protocol::PROTOCOL_VERSION;
pub use nestlock_protocol::RejectReason;
pub use safe_callback::SafeCallback;
pub use scheduler::LocalSynchronizer;
pub use scheduler::Scheduler;
pub use scheduler::Synchronizer;
pub use timeout::FailLoudTimeoutHandler;
pub use timeout::TimeoutAction;
pub use timeout::TimeoutHandler;
pub use transport::CoordinatorEvent;
pub use transport::CoordinatorTransport;
pub use transport::MemoryNetwork;
pub use transport::WorkerTransport;
pub use types::ExecutorId;
pub use types::LockDescriptor;
pub use types::LockRequest;
pub use types::LockStatus;
pub use types::LockTiming;
pub use types::PhaseReport;
pub use types::RequestHash;
pub use types::RequestOrigin;
pub use types::WorkerId;
pub use types::now_unix_ms;
