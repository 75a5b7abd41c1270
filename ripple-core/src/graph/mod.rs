//! Dependency Graph
//!
//! This module implements the computational dependency graph that tracks
//! relationships between reactive values and computations.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent values, derived computations or reactions
//! - Edges represent dependencies: if A reads B, there is an edge from B to A
//!
//! When a value changes, we traverse the graph to find all affected nodes
//! and mark them stale. The runtime then pulls the stale nodes that have an
//! observer, in topological order.
//!
//! # Design Decisions
//!
//! 1. The graph is centralised per runtime and indexed by node id. Producers
//!    know their dependents by id only, so the graph never keeps a derived
//!    node alive; its handles do.
//!
//! 2. We maintain both forward (recorded dependencies, with the version that
//!    was read) and reverse (subscribed dependents) edges. The versions let
//!    a stale node prove its cache is still good without recomputing.
//!
//! 3. Node records are type-erased; typed values stay in the handles.

mod node;
mod scheduler;
mod snapshot;

pub use node::{Dependency, Node, NodeId, NodeKind, NodeState};
pub(crate) use node::ReactiveRef;
pub use scheduler::Scheduler;
pub(crate) use scheduler::StaleSet;
pub use snapshot::{GraphSnapshot, NodeSnapshot};
