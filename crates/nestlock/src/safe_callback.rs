//! Early resolution for long-running bodies.
//!
//! A [`SafeCallback`] lets application code finish a body on its own terms
//! (for example when an external event already produced the answer) without
//! waiting for the lock's timeout. It is independent of the scheduler: when
//! used inside a locked scope, the scope simply ends earlier.

use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::MutexError;

/// Each `run` is tagged so that a finishing run only tears down its own
/// arming, never that of a run started after it was resolved.
#[derive(Debug)]
enum CallbackState<T> {
    Idle,
    Armed { run: u64, resolve: oneshot::Sender<T> },
    Resolved { run: u64 },
}

/// Races a body against an explicit [`resolve`](SafeCallback::resolve).
#[derive(Debug)]
pub struct SafeCallback<T> {
    state: Mutex<CallbackState<T>>,
    runs: AtomicU64,
}

impl<T> Default for SafeCallback<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(CallbackState::Idle),
            runs: AtomicU64::new(0),
        }
    }
}

impl<T> SafeCallback<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a body is currently running.
    pub fn is_armed(&self) -> bool {
        matches!(*self.state.lock(), CallbackState::Armed { .. })
    }

    /// Run `body` until it completes or [`resolve`](Self::resolve) is called,
    /// whichever comes first. An early resolution drops `body`.
    ///
    /// Fails with `SafeCallbackAlreadyArmed` while another body runs.
    pub async fn run<F>(&self, body: F) -> Result<T, MutexError>
    where F: Future<Output = T> {
        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let resolved = {
            let mut state = self.state.lock();
            if matches!(*state, CallbackState::Armed { .. }) {
                return Err(MutexError::SafeCallbackAlreadyArmed);
            }
            let (tx, rx) = oneshot::channel();
            *state = CallbackState::Armed { run, resolve: tx };
            rx
        };
        let _disarm = Disarm { state: &self.state, run };

        let value = tokio::select! {
            biased;
            Ok(value) = resolved => {
                debug!(run, "safe callback resolved early");
                value
            }
            value = body => value,
        };
        Ok(value)
    }

    /// Resolve the running body with `value`. Returns false if no body is
    /// running.
    pub fn resolve(&self, value: T) -> bool {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, CallbackState::Idle) {
            CallbackState::Armed { run, resolve } => {
                *state = CallbackState::Resolved { run };
                resolve.send(value).is_ok()
            }
            previous => {
                *state = previous;
                false
            }
        }
    }
}

/// Returns the callback to idle when `run` ends, also by cancellation.
struct Disarm<'a, T> {
    state: &'a Mutex<CallbackState<T>>,
    run: u64,
}

impl<T> Drop for Disarm<'_, T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let owned = match &*state {
            CallbackState::Armed { run, .. } | CallbackState::Resolved { run } => *run == self.run,
            CallbackState::Idle => false,
        };
        if owned {
            *state = CallbackState::Idle;
        }
    }
}
