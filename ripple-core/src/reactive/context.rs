//! Reader Context
//!
//! The reader context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a value is read through
//! a [`Reader`], the value is recorded as a dependency of the reader's
//! consumer.
//!
//! # Implementation
//!
//! A `Reader` is created on the stack for every evaluation of a derived node
//! or reaction and handed to the user function. Nested evaluations (a derived
//! node reading another derived node) create their own reader, so the
//! contexts form a stack that mirrors the call stack. The runtime keeps a
//! parallel stack of [`Frame`]s so that writes can tell whether they are
//! being issued from inside a derived computation.
//!
//! A reader also holds the runtime's turn lock, so all reads through it see
//! one consistent graph.

use std::cell::RefCell;

use parking_lot::ReentrantMutexGuard;
use smallvec::SmallVec;

use super::runtime::Runtime;
use crate::error::{Error, Result};
use crate::graph::{Dependency, NodeId, NodeKind};

/// An entry in the runtime's evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) node: NodeId,
    pub(crate) kind: NodeKind,
}

/// Handle passed to derived functions and reaction bodies.
///
/// Reading an observable through a tracking reader records it as a
/// dependency of the computation being evaluated. Readers obtained from
/// [`Runtime::reader`] track nothing.
pub struct Reader<'a> {
    rt: &'a Runtime,
    consumer: Option<NodeId>,
    reads: RefCell<SmallVec<[Dependency; 4]>>,
    _turn: ReentrantMutexGuard<'a, ()>,
}

impl<'a> Reader<'a> {
    pub(crate) fn tracking(rt: &'a Runtime, consumer: NodeId) -> Self {
        Self {
            rt,
            consumer: Some(consumer),
            reads: RefCell::new(SmallVec::new()),
            _turn: rt.turn(),
        }
    }

    pub(crate) fn plain(rt: &'a Runtime) -> Self {
        Self {
            rt,
            consumer: None,
            reads: RefCell::new(SmallVec::new()),
            _turn: rt.turn(),
        }
    }

    /// The runtime this reader belongs to.
    pub fn runtime(&self) -> &'a Runtime {
        self.rt
    }

    /// The computation being evaluated, if this reader tracks.
    pub fn consumer(&self) -> Option<NodeId> {
        self.consumer
    }

    /// Whether reads through this reader are recorded.
    pub fn is_tracking(&self) -> bool {
        self.consumer.is_some()
    }

    /// Run `f` with a reader that records nothing.
    ///
    /// Use this to peek at a value without depending on it.
    pub fn untracked<R>(&self, f: impl FnOnce(&Reader<'_>) -> R) -> R {
        let reader = Reader::plain(self.rt);
        f(&reader)
    }

    /// Number of distinct dependencies recorded so far.
    pub fn dependency_count(&self) -> usize {
        self.reads.borrow().len()
    }

    /// Fail if `node` lives in a different runtime than this reader.
    pub(crate) fn check_runtime(&self, owner: &Runtime, node: NodeId) -> Result<()> {
        if self.rt.ptr_eq(owner) {
            Ok(())
        } else {
            Err(Error::ForeignRuntime { node })
        }
    }

    /// Record a dependency on `node` at `version`.
    ///
    /// The first read of a node wins; reading it again later in the same
    /// evaluation does not change the recorded version.
    pub(crate) fn track(&self, node: NodeId, version: u64) {
        if self.consumer.is_none() {
            return;
        }
        let mut reads = self.reads.borrow_mut();
        if !reads.iter().any(|d| d.node == node) {
            reads.push(Dependency { node, version });
        }
    }

    /// Consume the reader, returning the dependencies it collected.
    pub(crate) fn finish(self) -> SmallVec<[Dependency; 4]> {
        self.reads.into_inner()
    }
}

impl std::fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("consumer", &self.consumer)
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_tracks_consumer() {
        let rt = Runtime::new();
        let id = NodeId::new();

        let reader = Reader::tracking(&rt, id);
        assert!(reader.is_tracking());
        assert_eq!(reader.consumer(), Some(id));

        let plain = rt.reader();
        assert!(!plain.is_tracking());
        assert!(plain.consumer().is_none());
    }

    #[test]
    fn reader_records_first_version_once() {
        let rt = Runtime::new();
        let reader = Reader::tracking(&rt, NodeId::new());
        let a = NodeId::new();
        let b = NodeId::new();

        reader.track(a, 1);
        reader.track(b, 4);
        reader.track(a, 2);

        let deps = reader.finish();
        assert_eq!(
            deps.as_slice(),
            &[
                Dependency { node: a, version: 1 },
                Dependency { node: b, version: 4 },
            ]
        );
    }

    #[test]
    fn untracked_reader_records_nothing() {
        let rt = Runtime::new();
        let reader = rt.reader();
        reader.track(NodeId::new(), 1);
        assert_eq!(reader.dependency_count(), 0);
    }

    #[test]
    fn nested_untracked_scope_does_not_leak_into_outer() {
        let rt = Runtime::new();
        let outer = Reader::tracking(&rt, NodeId::new());
        outer.track(NodeId::new(), 0);

        outer.untracked(|inner| {
            inner.track(NodeId::new(), 0);
            assert_eq!(inner.dependency_count(), 0);
        });

        assert_eq!(outer.dependency_count(), 1);
    }

    #[test]
    fn foreign_runtime_is_rejected() {
        let rt = Runtime::new();
        let other = Runtime::new();
        let reader = rt.reader();
        let node = NodeId::new();

        assert!(reader.check_runtime(&rt, node).is_ok());
        assert!(matches!(
            reader.check_runtime(&other, node),
            Err(Error::ForeignRuntime { .. })
        ));
    }
}
