use super::NodeId;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NodeShutdownKind {
    /// The node will come back with the same identity. Uploads keep running.
    Restart,
    /// The node is leaving the cluster. Shard snapshots pause and drop out of their entries.
    Remove,
    /// The node is being swapped for another one. Treated like `Remove` for snapshot purposes.
    Replace,
}

impl NodeShutdownKind {
    pub fn pauses_shard_snapshots(self) -> bool {
        matches!(self, Self::Remove | Self::Replace)
    }
}

#[derive(Clone, Debug)]
pub struct NodeShutdownMetadata {
    pub kind: NodeShutdownKind,
    pub reason: String,
    pub started_at_millis: u64,
}

/// Cluster-state section carrying per-node shutdown markers.
#[derive(Clone, Debug, Default)]
pub struct NodesShutdownMetadata {
    nodes: BTreeMap<NodeId, NodeShutdownMetadata>,
}

impl NodesShutdownMetadata {
    pub fn get(&self, node: &NodeId) -> Option<&NodeShutdownMetadata> {
        self.nodes.get(node)
    }

    pub fn pauses_shard_snapshots(&self, node: &NodeId) -> bool {
        self.get(node)
            .map(|metadata| metadata.kind.pauses_shard_snapshots())
            .unwrap_or(false)
    }

    pub fn insert(&mut self, node: NodeId, metadata: NodeShutdownMetadata) {
        self.nodes.insert(node, metadata);
    }

    pub fn remove(&mut self, node: &NodeId) -> Option<NodeShutdownMetadata> {
        self.nodes.remove(node)
    }
}
