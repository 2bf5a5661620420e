//! Pure admission logic for the scheduler.
//!
//! This module implements the "Functional Core, Imperative Shell" split: the
//! functions here never touch clocks, channels or locks. They take the queue as
//! a slice and return decisions; the [`Scheduler`](crate::scheduler::Scheduler)
//! applies them.
//!
//! # Module Organization
//!
//! - [`admission`]: per-request evaluation and the fixed-point pass
//! - [`dead_end`]: one-hop waits-for cycle detection
//!
//! # Tiger Style
//!
//! - Deterministic: same queue in, same decisions out
//! - Arrival order is the only tie-breaker
//! - Bounded: the fixed point is reached in at most `queue.len()` passes

pub mod admission;
pub mod dead_end;

pub use admission::Admission;
pub use admission::blocking_hashes;
pub use admission::compute_admissions;
pub use admission::evaluate;
pub use admission::parents_satisfied;
pub use admission::queued_writers;
pub use admission::running_blockers;
pub use dead_end::DeadEndReport;
pub use dead_end::find_dead_end;
