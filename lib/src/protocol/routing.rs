use super::{IndexId, NodeId, ShardId};
use std::collections::BTreeMap;

/// Where a shard's primary currently lives, as far as the routing table knows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrimaryLookup {
    Assigned(NodeId),
    /// The index exists but the shard has no primary right now (failover in progress).
    Unassigned,
    /// The index is gone or was never routed.
    Gone,
}

/// Primary assignments of one index.
#[derive(Clone, Debug)]
pub struct IndexRouting {
    pub id: IndexId,
    pub primaries: Vec<Option<NodeId>>,
}

impl IndexRouting {
    pub fn new(id: IndexId, primaries: Vec<Option<NodeId>>) -> Self {
        Self { id, primaries }
    }

    pub fn shard_count(&self) -> u32 {
        self.primaries.len() as u32
    }
}

/// Which node holds each shard's primary. In a full system this is derived from shard
/// allocation; the coordinator only ever reads it.
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    indices: BTreeMap<String, IndexRouting>,
}

impl RoutingTable {
    pub fn indices(&self) -> impl Iterator<Item = &IndexRouting> {
        self.indices.values()
    }

    pub fn index(&self, name: &str) -> Option<&IndexRouting> {
        self.indices.get(name)
    }

    pub fn insert(&mut self, routing: IndexRouting) {
        self.indices.insert(routing.id.name.clone(), routing);
    }

    pub fn remove(&mut self, name: &str) -> Option<IndexRouting> {
        self.indices.remove(name)
    }

    pub fn primary(&self, shard: &ShardId) -> PrimaryLookup {
        let Some(routing) = self.indices.get(&shard.index.name) else {
            return PrimaryLookup::Gone;
        };

        // A same-named index recreated under a different uuid does not carry the old shards.
        if routing.id.uuid != shard.index.uuid {
            return PrimaryLookup::Gone;
        }

        match routing.primaries.get(shard.shard as usize) {
            Some(Some(node)) => PrimaryLookup::Assigned(node.clone()),
            Some(None) => PrimaryLookup::Unassigned,
            None => PrimaryLookup::Gone,
        }
    }

    /// Drops the departed node from every assignment, leaving those shards unassigned until
    /// allocation places them elsewhere.
    pub fn remove_node(&mut self, node: &NodeId) {
        for routing in self.indices.values_mut() {
            for primary in &mut routing.primaries {
                if primary.as_ref() == Some(node) {
                    *primary = None;
                }
            }
        }
    }
}
