//! Serialisable dumps of the dependency graph for tooling.

use serde::{Deserialize, Serialize};

use super::node::{Node, NodeId, NodeKind, NodeState};

/// A point-in-time copy of every node record in a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// The runtime's configured name.
    pub runtime: Option<String>,
    /// Node records ordered by id.
    pub nodes: Vec<NodeSnapshot>,
}

/// One node record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: Option<String>,
    pub kind: NodeKind,
    pub state: NodeState,
    pub version: u64,
    pub observed: bool,
    pub disposed: bool,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id(),
            name: node.name().map(str::to_owned),
            kind: node.kind(),
            state: node.state(),
            version: node.version(),
            observed: node.is_observed(),
            disposed: node.is_disposed(),
            dependencies: node.dependencies().iter().map(|d| d.node).collect(),
            dependents: node.dependents().iter().copied().collect(),
        }
    }
}

impl GraphSnapshot {
    /// Look a node up by id.
    pub fn node(&self, id: NodeId) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look a node up by debug name.
    pub fn find(&self, name: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.name.as_deref() == Some(name))
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serialises_to_json() {
        let node = Node::derived().with_name(Some("total".into()));
        let snapshot = GraphSnapshot {
            runtime: Some("test".to_owned()),
            nodes: vec![NodeSnapshot::from(&node)],
        };

        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"kind\": \"derived\""));
        assert!(json.contains("\"state\": \"stale\""));
        assert!(json.contains("\"total\""));

        let parsed: GraphSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.find("total").map(|n| n.id), Some(node.id()));
    }
}
