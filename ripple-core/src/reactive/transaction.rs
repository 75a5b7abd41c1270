//! Transactions
//!
//! A transaction batches writes: values change immediately, but reactions
//! only run when the outermost transaction ends. Every write outside an
//! explicit transaction opens and commits an implicit one.
//!
//! Nesting is a depth counter. Ending an inner transaction does nothing
//! beyond decrementing it; the outermost end runs the commit pass.
//!
//! The [`Transaction`] guard commits on drop, so the commit happens on every
//! exit path, including early returns and panics.
//!
//! # Writes From Reactions
//!
//! While a commit round runs, writes issued by reaction bodies are staged
//! in their containers and queued here. They are applied together once the
//! round's reactions are done, and their consequences run as the next
//! round. Every reaction in a round therefore sees the same values, and a
//! reaction does not read back its own staged writes.

use parking_lot::ReentrantMutexGuard;
use tracing::trace;

use super::runtime::Runtime;
use crate::error::{Error, Result};
use crate::graph::{NodeId, StaleSet};

/// Applies a staged write. Returns whether the node changed.
pub(crate) type FlushFn = Box<dyn FnOnce() -> bool + Send>;

/// A write staged by a reaction body, applied when the round ends.
pub(crate) struct DeferredWrite {
    pub(crate) node: NodeId,
    pub(crate) flush: FlushFn,
}

impl std::fmt::Debug for DeferredWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredWrite").field("node", &self.node).finish()
    }
}

/// Batch bookkeeping stored in the runtime state.
#[derive(Debug, Default)]
pub(crate) struct BatchState {
    /// Open transactions.
    pub(crate) depth: usize,
    /// A commit pass is running.
    pub(crate) committing: bool,
    /// Number of commit passes started so far.
    pub(crate) commit: u64,
    /// Invalidated nodes and reactions waiting for the next commit round.
    pub(crate) pending: StaleSet,
    /// Writes staged by reaction bodies during the current round.
    pub(crate) deferred: Vec<DeferredWrite>,
}

impl BatchState {
    /// Whether a commit pass has anything to do.
    fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.deferred.is_empty()
    }
}

/// An open transaction. Commits when dropped.
///
/// Holding a transaction also holds the runtime's turn, so no other thread
/// can observe the graph halfway through the batch.
#[must_use = "dropping a transaction commits it immediately"]
pub struct Transaction<'a> {
    rt: &'a Runtime,
    _turn: ReentrantMutexGuard<'a, ()>,
}

impl<'a> Transaction<'a> {
    /// The runtime this transaction batches.
    pub fn runtime(&self) -> &'a Runtime {
        self.rt
    }

    /// Commit now. Equivalent to dropping the guard.
    pub fn commit(self) {
        drop(self);
    }

    /// Fail if `node` does not belong to this transaction's runtime.
    pub(crate) fn check_runtime(&self, owner: &Runtime, node: NodeId) -> Result<()> {
        if self.rt.ptr_eq(owner) {
            Ok(())
        } else {
            Err(Error::ForeignRuntime { node })
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.rt.end_batch();
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.rt.lock().batch.depth)
            .finish()
    }
}

/// Resets the committing flag even if a reaction unwinds out of the pass.
struct CommitGuard<'a> {
    rt: &'a Runtime,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.rt.lock().batch.committing = false;
    }
}

impl Runtime {
    /// Open a transaction. Reactions are deferred until the outermost
    /// transaction is dropped.
    pub fn begin(&self) -> Transaction<'_> {
        let turn = self.turn();
        self.lock().batch.depth += 1;
        Transaction {
            rt: self,
            _turn: turn,
        }
    }

    /// Run `f` inside a transaction.
    ///
    /// The transaction commits when `f` returns, whether it returns an error
    /// or unwinds, so reactions always see the writes `f` made.
    pub fn transaction<R>(&self, f: impl FnOnce(&Transaction<'_>) -> R) -> R {
        let tx = self.begin();
        f(&tx)
    }

    /// Whether a transaction is open on this runtime.
    pub fn in_transaction(&self) -> bool {
        let state = self.lock();
        state.batch.depth > 0 || state.batch.committing
    }

    pub(crate) fn end_batch(&self) {
        {
            let mut state = self.lock();
            state.batch.depth = state.batch.depth.saturating_sub(1);
            if state.batch.depth > 0 || state.batch.committing {
                return;
            }
            if !state.batch.has_work() {
                return;
            }
            state.batch.committing = true;
            state.batch.commit += 1;
        }
        trace!("committing outermost transaction");
        let _committing = CommitGuard { rt: self };
        self.commit_rounds();
    }
}
