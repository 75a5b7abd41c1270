//! Triggers
//!
//! A trigger is a value with no payload. Reading it records a dependency;
//! firing it invalidates everything that read it. Use it to wire external
//! change sources (a file watcher, a clock) into the graph.

use std::sync::Arc;

use super::context::Reader;
use super::runtime::Runtime;
use crate::error::Result;
use crate::graph::{Node, NodeId};

struct TriggerInner {
    id: NodeId,
    rt: Runtime,
}

impl Drop for TriggerInner {
    fn drop(&mut self) {
        self.rt.remove_node(self.id);
    }
}

/// A payload-free change signal.
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl Runtime {
    /// Create a trigger.
    pub fn trigger(&self) -> Trigger {
        let id = self.register(Node::value());
        Trigger {
            inner: Arc::new(TriggerInner {
                id,
                rt: self.clone(),
            }),
        }
    }
}

impl Trigger {
    /// The node id.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Give the node a debug name.
    pub fn named(self, name: &str) -> Self {
        self.inner.rt.set_name(self.inner.id, name);
        self
    }

    /// Depend on this trigger.
    pub fn read(&self, reader: &Reader<'_>) -> Result<()> {
        reader.check_runtime(&self.inner.rt, self.inner.id)?;
        let version = self.inner.rt.version(self.inner.id)?;
        reader.track(self.inner.id, version);
        Ok(())
    }

    /// Invalidate everything that read this trigger.
    ///
    /// Fired from a reaction during a commit, the invalidation lands once
    /// the current round ends.
    pub fn fire(&self) -> Result<()> {
        let inner = &self.inner;
        let _turn = inner.rt.turn();
        if inner.rt.stages_writes(inner.id)? {
            inner.rt.defer_write(inner.id, Box::new(|| true));
            return Ok(());
        }
        inner.rt.write(inner.id, || true).map(drop)
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger").field("id", &self.inner.id).finish()
    }
}
