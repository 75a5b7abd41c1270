//! Update Scheduler
//!
//! The scheduler owns the node records and decides which nodes must be
//! revisited after a change, and in which order.
//!
//! # Algorithm
//!
//! 1. When a source changes, bump its version and flip every transitively
//!    reachable `UpToDate` dependent to `Stale`. The flip doubles as the
//!    visited marker: a node that is already `Stale` has stale dependents
//!    too, so the walk stops there.
//! 2. Every flipped node is collected in a [`StaleSet`]; flipped reactions
//!    are collected separately.
//! 3. At commit the stale set is sorted topologically (producers before
//!    consumers) and the runtime pulls each node in that order.
//!
//! Flipping flags is O(affected nodes). Recomputation is deferred to the
//! pull, and skipped entirely for nodes nobody observes.
//!
//! # Observation
//!
//! Only observed nodes are subscribed to their producers. When a derived
//! node gains its first dependent it subscribes to its own recorded
//! dependencies (recursively), and when it loses its last one it
//! unsubscribes again.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::node::{Dependency, Node, NodeId, NodeKind, NodeState, ReactiveRef};
use super::snapshot::{GraphSnapshot, NodeSnapshot};
use crate::reactive::Reactive;

/// Nodes invalidated during a batch, in invalidation order.
#[derive(Debug, Default)]
pub(crate) struct StaleSet {
    pub(crate) nodes: IndexSet<NodeId>,
    pub(crate) reactions: IndexSet<NodeId>,
}

impl StaleSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.reactions.is_empty()
    }

    pub(crate) fn insert(&mut self, id: NodeId, kind: NodeKind) {
        self.nodes.insert(id);
        if kind == NodeKind::Reaction {
            self.reactions.insert(id);
        }
    }
}

/// The update scheduler manages the dependency graph and coordinates updates.
#[derive(Debug, Default)]
pub struct Scheduler {
    nodes: HashMap<NodeId, Node>,
}

impl Scheduler {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Unsubscribes it from its producers. Consumers keep their recorded
    /// dependency on the id and treat the missing node as changed the next
    /// time they validate.
    pub(crate) fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;
        if node.is_observed() {
            for dep in &node.dependencies {
                self.release(dep.node, node_id);
            }
        }
        for dependent in &node.dependents {
            if let Some(consumer) = self.nodes.get_mut(dependent) {
                if consumer.state == NodeState::UpToDate {
                    consumer.state = NodeState::Stale;
                }
            }
        }
        Some(node)
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable reference to a node.
    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    /// Current version of a node, if it exists.
    pub fn version(&self, node_id: NodeId) -> Option<u64> {
        self.nodes.get(&node_id).map(Node::version)
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over all node records, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub(crate) fn reactive(&self, node_id: NodeId) -> Option<Arc<dyn Reactive>> {
        self.nodes.get(&node_id).and_then(|n| n.reactive.upgrade())
    }

    /// Subscribe `consumer` to `producer`.
    ///
    /// If `producer` is a derived node that was not observed before, it
    /// subscribes to its own dependencies and works out whether its cache is
    /// still trustworthy. Returns false if the producer is gone or disposed.
    pub(crate) fn observe(&mut self, producer: NodeId, consumer: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&producer) else {
            return false;
        };
        if node.disposed {
            return false;
        }
        let was_observed = node.is_observed();
        node.dependents.insert(consumer);
        if !was_observed && node.kind() == NodeKind::Derived {
            self.activate(producer);
        }
        true
    }

    /// Unsubscribe `consumer` from `producer`, releasing the producer's own
    /// subscriptions if nothing observes it anymore.
    pub(crate) fn release(&mut self, producer: NodeId, consumer: NodeId) {
        let Some(node) = self.nodes.get_mut(&producer) else {
            return;
        };
        node.dependents.shift_remove(&consumer);
        if node.kind() == NodeKind::Derived && !node.is_observed() {
            self.deactivate(producer);
        }
    }

    /// Take a keep-alive reference on a node.
    pub(crate) fn retain(&mut self, node_id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return false;
        };
        if node.disposed {
            return false;
        }
        let was_observed = node.is_observed();
        node.keep_alive += 1;
        if !was_observed && node.kind() == NodeKind::Derived {
            self.activate(node_id);
        }
        true
    }

    /// Drop a keep-alive reference taken with [`retain`](Self::retain).
    pub(crate) fn unretain(&mut self, node_id: NodeId) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        node.keep_alive = node.keep_alive.saturating_sub(1);
        if node.kind() == NodeKind::Derived && !node.is_observed() {
            self.deactivate(node_id);
        }
    }

    fn activate(&mut self, node_id: NodeId) {
        let deps: SmallVec<[Dependency; 4]> = match self.nodes.get(&node_id) {
            Some(node) => node.dependencies.clone(),
            None => return,
        };
        for dep in &deps {
            self.observe(dep.node, node_id);
        }
        let fresh = self.dependencies_current(node_id);
        if let Some(node) = self.nodes.get_mut(&node_id) {
            // A failed node recomputes on its next read regardless, so it
            // stays UpToDate and invalidation keeps flowing through it.
            if node.state != NodeState::Updating {
                node.state = if node.failure.is_some() || (fresh && node.evaluated) {
                    NodeState::UpToDate
                } else {
                    NodeState::Stale
                };
            }
        }
    }

    fn deactivate(&mut self, node_id: NodeId) {
        let deps: SmallVec<[Dependency; 4]> = match self.nodes.get(&node_id) {
            Some(node) => node.dependencies.clone(),
            None => return,
        };
        for dep in &deps {
            self.release(dep.node, node_id);
        }
    }

    /// True if every recorded dependency still exists, is settled and has
    /// the version that was read.
    pub(crate) fn dependencies_current(&self, node_id: NodeId) -> bool {
        let Some(node) = self.nodes.get(&node_id) else {
            return false;
        };
        node.dependencies.iter().all(|dep| match self.nodes.get(&dep.node) {
            Some(producer) => {
                !producer.disposed
                    && producer.version == dep.version
                    && producer.state == NodeState::UpToDate
            }
            None => false,
        })
    }

    /// Replace a consumer's recorded dependencies, diffing its subscriptions
    /// if it is observed. New edges are added before stale ones are dropped,
    /// so a producer shared by both sets is never released in between.
    pub(crate) fn set_dependencies(&mut self, consumer: NodeId, deps: SmallVec<[Dependency; 4]>) {
        let Some(node) = self.nodes.get_mut(&consumer) else {
            return;
        };
        if node.disposed {
            return;
        }
        let observed = node.is_observed();
        let old = std::mem::replace(&mut node.dependencies, deps.clone());
        if !observed {
            return;
        }
        for dep in &deps {
            if !old.iter().any(|o| o.node == dep.node) {
                self.observe(dep.node, consumer);
            }
        }
        for dep in &old {
            if !deps.iter().any(|n| n.node == dep.node) {
                self.release(dep.node, consumer);
            }
        }
    }

    /// Decide the state of a node that just finished evaluating.
    ///
    /// An observed node whose inputs moved while it ran (a producer disposed
    /// from inside a reaction, say) ends `Stale` and is queued again. A
    /// failed evaluation is never queued again: the next change to one of
    /// its inputs retries it, and a derived node also retries on its next
    /// read after the commit.
    pub(crate) fn settle(&mut self, node_id: NodeId, failed: bool, stale: &mut StaleSet) -> NodeState {
        let observed = match self.nodes.get(&node_id) {
            Some(node) if !node.disposed => node.is_observed(),
            _ => return NodeState::Stale,
        };
        let state = if failed || !observed || self.dependencies_current(node_id) {
            NodeState::UpToDate
        } else {
            NodeState::Stale
        };
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.state = state;
            if state == NodeState::Stale {
                stale.insert(node_id, node.kind());
            }
        }
        state
    }

    /// Mark a source node as changed and propagate staleness.
    ///
    /// Newly invalidated nodes are appended to `stale`.
    pub(crate) fn mark_changed(&mut self, source_id: NodeId, stale: &mut StaleSet) {
        let mut queue = VecDeque::new();

        if let Some(source) = self.nodes.get_mut(&source_id) {
            source.version += 1;
            queue.extend(source.dependents.iter().copied());
        }

        while let Some(node_id) = queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&node_id) else {
                continue;
            };
            if node.disposed || node.state != NodeState::UpToDate {
                continue;
            }
            node.state = NodeState::Stale;
            stale.insert(node_id, node.kind());
            queue.extend(node.dependents.iter().copied());
        }
    }

    /// Dispose a node: invalidate its dependents, unsubscribe it from its
    /// producers and detach its computation.
    ///
    /// The computation handle is returned so the caller can drop it after
    /// releasing the graph lock.
    pub(crate) fn dispose(&mut self, node_id: NodeId, stale: &mut StaleSet) -> Option<ReactiveRef> {
        let (observed, deps, dependents) = {
            let node = self.nodes.get_mut(&node_id)?;
            if node.disposed {
                return None;
            }
            let observed = node.is_observed();
            node.disposed = true;
            node.state = NodeState::Stale;
            node.keep_alive = 0;
            let deps = std::mem::take(&mut node.dependencies);
            let dependents = std::mem::take(&mut node.dependents);
            (observed, deps, dependents)
        };

        if observed {
            for dep in &deps {
                self.release(dep.node, node_id);
            }
        }

        for dependent in dependents {
            let Some(node) = self.nodes.get_mut(&dependent) else {
                continue;
            };
            if node.state == NodeState::UpToDate {
                node.state = NodeState::Stale;
                stale.insert(dependent, node.kind());
                let next: Vec<NodeId> = node.dependents.iter().copied().collect();
                for id in next {
                    self.invalidate(id, stale);
                }
            }
        }

        self.nodes
            .get_mut(&node_id)
            .map(|node| std::mem::replace(&mut node.reactive, ReactiveRef::None))
    }

    fn invalidate(&mut self, node_id: NodeId, stale: &mut StaleSet) {
        let mut queue = VecDeque::from([node_id]);
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.disposed || node.state != NodeState::UpToDate {
                continue;
            }
            node.state = NodeState::Stale;
            stale.insert(id, node.kind());
            queue.extend(node.dependents.iter().copied());
        }
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that dependencies come before dependents.
    /// Ties keep the input order. Ids no longer in the graph are dropped.
    pub(crate) fn topological_sort(&self, nodes: &IndexSet<NodeId>) -> Vec<NodeId> {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        // Calculate in-degrees (only counting edges within the node set)
        for &node_id in nodes {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies
                    .iter()
                    .filter(|d| nodes.contains(&d.node))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                for dependent_id in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(*dependent_id);
                        }
                    }
                }
            }
        }

        result
    }

    /// Produce a serialisable dump of the graph, ordered by node id.
    pub fn snapshot(&self, runtime: Option<String>) -> GraphSnapshot {
        let mut nodes: Vec<NodeSnapshot> = self.nodes.values().map(NodeSnapshot::from).collect();
        nodes.sort_by_key(|n| n.id);
        GraphSnapshot { runtime, nodes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Scheduler, NodeId, NodeId, NodeId) {
        // source -> derived1 -> derived2, with derived2 kept alive
        let mut scheduler = Scheduler::new();
        let source_id = scheduler.add_node(Node::value());
        let derived1_id = scheduler.add_node(Node::derived());
        let derived2_id = scheduler.add_node(Node::derived());

        for id in [derived1_id, derived2_id] {
            let node = scheduler.get_node_mut(id).unwrap();
            node.evaluated = true;
            node.state = NodeState::UpToDate;
        }
        scheduler.set_dependencies(
            derived1_id,
            SmallVec::from_slice(&[Dependency { node: source_id, version: 0 }]),
        );
        scheduler.set_dependencies(
            derived2_id,
            SmallVec::from_slice(&[Dependency { node: derived1_id, version: 0 }]),
        );
        assert!(scheduler.retain(derived2_id));
        (scheduler, source_id, derived1_id, derived2_id)
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut scheduler = Scheduler::new();

        let id1 = scheduler.add_node(Node::value());
        let id2 = scheduler.add_node(Node::derived());

        assert_eq!(scheduler.node_count(), 2);

        scheduler.remove_node(id1);
        assert_eq!(scheduler.node_count(), 1);
        assert!(scheduler.get_node(id1).is_none());
        assert!(scheduler.get_node(id2).is_some());
    }

    #[test]
    fn retain_subscribes_transitively() {
        let (scheduler, source_id, derived1_id, derived2_id) = chain();

        assert!(scheduler.get_node(source_id).unwrap().dependents().contains(&derived1_id));
        assert!(scheduler.get_node(derived1_id).unwrap().dependents().contains(&derived2_id));
        assert_eq!(scheduler.get_node(derived2_id).unwrap().state(), NodeState::UpToDate);
    }

    #[test]
    fn unretain_releases_transitively() {
        let (mut scheduler, source_id, derived1_id, derived2_id) = chain();
        scheduler.unretain(derived2_id);

        assert!(scheduler.get_node(source_id).unwrap().dependents().is_empty());
        assert!(scheduler.get_node(derived1_id).unwrap().dependents().is_empty());
    }

    #[test]
    fn unobserved_nodes_do_not_subscribe() {
        let mut scheduler = Scheduler::new();
        let source_id = scheduler.add_node(Node::value());
        let derived_id = scheduler.add_node(Node::derived());

        scheduler.set_dependencies(
            derived_id,
            SmallVec::from_slice(&[Dependency { node: source_id, version: 0 }]),
        );

        assert!(scheduler.get_node(source_id).unwrap().dependents().is_empty());
        assert!(scheduler.get_node(derived_id).unwrap().depends_on(source_id));
    }

    #[test]
    fn mark_changed_propagates() {
        let (mut scheduler, source_id, derived1_id, derived2_id) = chain();
        let mut stale = StaleSet::default();

        scheduler.mark_changed(source_id, &mut stale);

        assert_eq!(scheduler.version(source_id), Some(1));
        assert_eq!(stale.nodes.len(), 2);
        assert_eq!(scheduler.get_node(derived1_id).unwrap().state(), NodeState::Stale);
        assert_eq!(scheduler.get_node(derived2_id).unwrap().state(), NodeState::Stale);

        // Already stale: a second change bumps the version but flips nothing
        let mut again = StaleSet::default();
        scheduler.mark_changed(source_id, &mut again);
        assert_eq!(scheduler.version(source_id), Some(2));
        assert!(again.is_empty());
    }

    #[test]
    fn topological_sort_orders_producers_first() {
        let (mut scheduler, source_id, derived1_id, derived2_id) = chain();
        let mut stale = StaleSet::default();
        scheduler.mark_changed(source_id, &mut stale);

        let mut reversed = IndexSet::new();
        reversed.insert(derived2_id);
        reversed.insert(derived1_id);

        let order = scheduler.topological_sort(&reversed);
        assert_eq!(order, vec![derived1_id, derived2_id]);
    }

    #[test]
    fn settle_detects_moved_inputs() {
        let (mut scheduler, source_id, derived1_id, _) = chain();
        let mut stale = StaleSet::default();

        // The source moves on without derived1 being told
        scheduler.get_node_mut(source_id).unwrap().version = 5;
        assert_eq!(scheduler.settle(derived1_id, false, &mut stale), NodeState::Stale);
        assert!(stale.nodes.contains(&derived1_id));
    }

    #[test]
    fn settle_never_requeues_failures() {
        let (mut scheduler, source_id, derived1_id, _) = chain();
        let mut stale = StaleSet::default();

        scheduler.get_node_mut(source_id).unwrap().version = 5;
        assert_eq!(scheduler.settle(derived1_id, true, &mut stale), NodeState::UpToDate);
        assert!(stale.is_empty());
    }

    #[test]
    fn failed_nodes_pass_invalidation_on() {
        let (mut scheduler, source_id, derived1_id, derived2_id) = chain();
        scheduler
            .get_node_mut(derived1_id)
            .unwrap()
            .record_failure(0, crate::error::Error::msg("boom"));

        let mut stale = StaleSet::default();
        scheduler.mark_changed(source_id, &mut stale);
        assert!(stale.nodes.contains(&derived1_id));
        assert!(stale.nodes.contains(&derived2_id));
    }

    #[test]
    fn dispose_invalidates_dependents() {
        let (mut scheduler, source_id, derived1_id, derived2_id) = chain();
        let mut stale = StaleSet::default();

        scheduler.dispose(derived1_id, &mut stale);

        let node = scheduler.get_node(derived1_id).unwrap();
        assert!(node.is_disposed());
        assert!(node.dependents().is_empty());
        assert!(scheduler.get_node(source_id).unwrap().dependents().is_empty());
        assert_eq!(scheduler.get_node(derived2_id).unwrap().state(), NodeState::Stale);
        assert!(!scheduler.observe(derived1_id, derived2_id));
    }
}
