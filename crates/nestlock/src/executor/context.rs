//! Per-call-chain lock stack.
//!
//! The stack lives in a tokio task-local and is re-scoped for every locked
//! body, so it follows the body across `.await` points but is never visible
//! to a task spawned from it.

use std::future::Future;

use crate::key::LockKey;
use crate::types::ExecutorId;
use crate::types::RequestHash;

tokio::task_local! {
    static LOCK_STACK: LockStack;
}

/// One open locked scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    /// Request held by the scope.
    pub hash: RequestHash,
    /// Key of the request.
    pub key: LockKey,
    /// Exclusive or shared.
    pub single_access: bool,
    /// Executor that issued the request.
    pub executor: ExecutorId,
}

/// Locked scopes enclosing the current code, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStack {
    entries: Vec<StackEntry>,
}

impl LockStack {
    /// Stack of the calling chain; empty outside any locked scope.
    pub fn current() -> Self {
        LOCK_STACK.try_with(Clone::clone).unwrap_or_default()
    }

    /// Entries, outermost first.
    pub fn entries(&self) -> &[StackEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries issued by `executor`.
    pub fn owned_by(&self, executor: ExecutorId) -> impl Iterator<Item = &StackEntry> {
        self.entries.iter().filter(move |e| e.executor == executor)
    }

    /// Innermost scope of `executor`.
    pub fn innermost(&self, executor: ExecutorId) -> Option<&StackEntry> {
        self.entries.iter().rev().find(|e| e.executor == executor)
    }

    /// Enclosing scopes of `executor` whose keys are related to `key`.
    pub fn parents_for(&self, executor: ExecutorId, key: &LockKey) -> Vec<RequestHash> {
        self.owned_by(executor).filter(|e| e.key.is_related(key)).map(|e| e.hash).collect()
    }

    /// Every enclosing scope of `executor`.
    pub fn tree_for(&self, executor: ExecutorId) -> Vec<RequestHash> {
        self.owned_by(executor).map(|e| e.hash).collect()
    }
}

/// Run `future` with `entry` pushed onto the current chain's stack.
pub(crate) async fn with_entry<F: Future>(entry: StackEntry, future: F) -> F::Output {
    let mut stack = LockStack::current();
    stack.entries.push(entry);
    LOCK_STACK.scope(stack, future).await
}

/// Run `future` as a fresh call chain that inherits no locked scope.
///
/// Needed when independent chains are joined inside one task instead of
/// being spawned.
pub async fn detached<F: Future>(future: F) -> F::Output {
    LOCK_STACK.scope(LockStack::default(), future).await
}
