//! What happens when a request outlives its maximum locking time.
//!
//! A stuck exclusive lock can wedge a whole key domain, so the default stance
//! is to fail loud: terminate the worker that owns the request, or abort the
//! coordinator if the request is its own. With `continue_on_timeout` only the
//! waiting caller is rejected and the request is force-unlocked; the caller's
//! in-flight work is then no longer protected.

use std::fmt;

use tracing::error;

use crate::types::LockDescriptor;
use crate::types::RequestOrigin;

/// Action the scheduler takes for a timed-out request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Reject the awaiting caller with `LockTimeout` and force-unlock.
    RejectCaller,
    /// Terminate the owning worker, or abort if the request is local.
    Terminate,
}

/// Decides what to do with a timed-out request.
///
/// Called outside of the scheduler lock, once per expired request.
pub trait TimeoutHandler: Send + Sync + fmt::Debug {
    /// Inspect the expired request and pick an action.
    fn handle_timeout(&self, descriptor: &LockDescriptor, origin: &RequestOrigin) -> TimeoutAction;
}

/// Default handler: log at error level, escalate unless configured to
/// continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailLoudTimeoutHandler {
    continue_on_timeout: bool,
}

impl FailLoudTimeoutHandler {
    /// Create the handler for the given `continue_on_timeout` setting.
    pub fn new(continue_on_timeout: bool) -> Self {
        Self { continue_on_timeout }
    }
}

impl TimeoutHandler for FailLoudTimeoutHandler {
    fn handle_timeout(&self, descriptor: &LockDescriptor, origin: &RequestOrigin) -> TimeoutAction {
        error!(
            hash = %descriptor.hash,
            key = %descriptor.key_path(),
            status = descriptor.status.as_str(),
            worker = ?origin.worker(),
            phases = descriptor.reported_phases.len(),
            "lock exceeded its maximum locking time"
        );
        if let Some(call_site) = &descriptor.call_site {
            error!(hash = %descriptor.hash, "timed-out lock was requested at:\n{call_site}");
        }
        if self.continue_on_timeout {
            TimeoutAction::RejectCaller
        } else {
            TimeoutAction::Terminate
        }
    }
}
