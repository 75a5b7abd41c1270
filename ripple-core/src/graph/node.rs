//! Graph Nodes
//!
//! This module defines the node records that live in the dependency graph.
//! A record carries only type-erased bookkeeping: identity, state, version
//! and edges. Typed values live in the handles (`Value<T>`, `Derived<T>`)
//! that own the node.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::Error;
use crate::reactive::Reactive;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    ///
    /// IDs are unique across every runtime in the process.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A source node (value, trigger or container). Has dependents only.
    Value,

    /// A cached computation. Has dependencies and may have dependents.
    Derived,

    /// A side-effecting root consumer. Has dependencies, never dependents.
    Reaction,
}

/// Freshness of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// The cached result matches the current values of all dependencies.
    UpToDate,

    /// A transitive dependency changed; the node must be revalidated before
    /// its cache can be trusted.
    Stale,

    /// The node is evaluating (or validating) right now. Reading it in this
    /// state means the graph has a cycle.
    Updating,
}

/// One recorded dependency: the producer and the version observed when it
/// was last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// The producer that was read.
    pub node: NodeId,
    /// The producer's version at read time.
    pub version: u64,
}

/// How the graph reaches the computation behind a node.
///
/// Derived nodes are owned by their handles, so the graph only keeps a weak
/// reference. Reactions are owned by the graph until disposed.
pub(crate) enum ReactiveRef {
    None,
    Weak(Weak<dyn Reactive>),
    Strong(Arc<dyn Reactive>),
}

impl ReactiveRef {
    pub(crate) fn upgrade(&self) -> Option<Arc<dyn Reactive>> {
        match self {
            ReactiveRef::None => None,
            ReactiveRef::Weak(weak) => weak.upgrade(),
            ReactiveRef::Strong(strong) => Some(Arc::clone(strong)),
        }
    }
}

impl fmt::Debug for ReactiveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactiveRef::None => f.write_str("None"),
            ReactiveRef::Weak(_) => f.write_str("Weak"),
            ReactiveRef::Strong(_) => f.write_str("Strong"),
        }
    }
}

/// A failed evaluation of a derived node.
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    /// Commit pass the failure happened in.
    pub(crate) commit: u64,
    pub(crate) error: Error,
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    pub(crate) state: NodeState,

    /// Bumped every time the node's observable output changes.
    pub(crate) version: u64,

    pub(crate) name: Option<Arc<str>>,

    /// Producers read during the last evaluation, in read order.
    pub(crate) dependencies: SmallVec<[Dependency; 4]>,

    /// Consumers currently subscribed to this node.
    pub(crate) dependents: IndexSet<NodeId>,

    /// Outstanding `keep_observed` guards.
    pub(crate) keep_alive: usize,

    /// True once the computation has completed successfully at least once.
    pub(crate) evaluated: bool,

    /// The last evaluation failed. The next read recomputes, unless it
    /// happens during the same commit, which gets the error back instead.
    pub(crate) failure: Option<Failure>,

    pub(crate) disposed: bool,

    pub(crate) reactive: ReactiveRef,
}

impl Node {
    /// Create a new node with the given kind.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            state: match kind {
                NodeKind::Value => NodeState::UpToDate,
                // Start stale so the first read evaluates.
                NodeKind::Derived | NodeKind::Reaction => NodeState::Stale,
            },
            version: 0,
            name: None,
            dependencies: SmallVec::new(),
            dependents: IndexSet::new(),
            keep_alive: 0,
            evaluated: false,
            failure: None,
            disposed: false,
            reactive: ReactiveRef::None,
        }
    }

    /// Create a new source node.
    pub fn value() -> Self {
        Self::new(NodeKind::Value)
    }

    /// Create a new derived node.
    pub fn derived() -> Self {
        Self::new(NodeKind::Derived)
    }

    /// Create a new reaction node.
    pub fn reaction() -> Self {
        Self::new(NodeKind::Reaction)
    }

    pub(crate) fn with_reactive(mut self, reactive: ReactiveRef) -> Self {
        self.reactive = reactive;
        self
    }

    pub(crate) fn with_name(mut self, name: Option<Arc<str>>) -> Self {
        self.name = name;
        self
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Get the current state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Get the current version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Get the debug name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether something keeps this node subscribed to its producers.
    ///
    /// Reactions are always observed. Derived nodes are observed while they
    /// have a dependent or an outstanding keep-alive guard.
    pub fn is_observed(&self) -> bool {
        match self.kind {
            NodeKind::Reaction => !self.disposed,
            NodeKind::Value | NodeKind::Derived => {
                !self.dependents.is_empty() || self.keep_alive > 0
            }
        }
    }

    /// Whether the node has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Recorded dependencies from the last evaluation.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Subscribed dependents.
    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    /// Record a failed evaluation.
    ///
    /// The node is left `UpToDate` so invalidation keeps flowing through it,
    /// and its version moves so consumers that read the old value re-run.
    pub(crate) fn record_failure(&mut self, commit: u64, error: Error) {
        self.version += 1;
        self.state = NodeState::UpToDate;
        self.failure = Some(Failure { commit, error });
    }

    pub(crate) fn depends_on(&self, node: NodeId) -> bool {
        self.dependencies.iter().any(|d| d.node == node)
    }
}
