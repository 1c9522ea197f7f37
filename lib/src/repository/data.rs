use crate::protocol::{
    IndexUuid, RepositoryGeneration, ShardGeneration, ShardId, SnapshotState, SnapshotUuid,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lowest repository format version able to read data written by this implementation.
pub(crate) const MIN_VERSION: &str = "1.0.0";

/// One completed (or failed-and-recorded) snapshot inside the root metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub uuid: SnapshotUuid,
    pub name: String,
    pub state: SnapshotState,
}

/// The parsed contents of the root `index-N` blob. The generation itself comes from the blob
/// name, not the body, so an out-of-band rename is only detectable against the expected value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryData {
    #[serde(skip, default = "RepositoryGeneration::unknown")]
    pub generation: RepositoryGeneration,
    pub snapshots: Vec<SnapshotRecord>,
    /// Per index: which metadata blob each snapshot references. Metadata blobs are shared
    /// across snapshots for as long as the index itself does not change.
    pub index_metadata_generations: BTreeMap<IndexUuid, BTreeMap<SnapshotUuid, String>>,
    /// Per index: the latest metadata generation of each shard.
    pub shard_generations: BTreeMap<IndexUuid, Vec<Option<ShardGeneration>>>,
    pub min_version: String,
}

impl RepositoryGeneration {
    fn unknown() -> Self {
        Self::UNKNOWN
    }
}

impl RepositoryData {
    /// Data of a repository with no root index blob at all.
    pub fn empty() -> Self {
        Self {
            generation: RepositoryGeneration::EMPTY,
            snapshots: Vec::new(),
            index_metadata_generations: BTreeMap::new(),
            shard_generations: BTreeMap::new(),
            min_version: MIN_VERSION.to_owned(),
        }
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.snapshots.iter().any(|record| record.name == name)
    }

    pub fn shard_generation(&self, shard: &ShardId) -> Option<ShardGeneration> {
        self.shard_generations
            .get(&shard.index.uuid)?
            .get(shard.shard as usize)
            .copied()
            .flatten()
    }

    pub fn index_metadata_uuid(&self, index: &IndexUuid) -> Option<&str> {
        self.index_metadata_generations
            .get(index)?
            .values()
            .next()
            .map(String::as_str)
    }

    /// Records a finalized snapshot: its record, its index metadata references and the shard
    /// generations its successful uploads produced.
    pub fn add_snapshot(
        &mut self,
        record: SnapshotRecord,
        index_metadata: impl IntoIterator<Item = (IndexUuid, String)>,
        produced: impl IntoIterator<Item = (ShardId, ShardGeneration)>,
    ) {
        let uuid = record.uuid;

        debug_assert!(!self.contains_name(&record.name));
        self.snapshots.push(record);

        for (index, meta_uuid) in index_metadata {
            self.index_metadata_generations
                .entry(index)
                .or_default()
                .insert(uuid, meta_uuid);
        }

        for (shard, generation) in produced {
            let generations = self
                .shard_generations
                .entry(shard.index.uuid)
                .or_default();
            let slot = shard.shard as usize;
            if generations.len() <= slot {
                generations.resize(slot + 1, None);
            }
            generations[slot] = Some(generation);
        }
    }

    /// Removes the named snapshots. Returns the blob paths orphaned by the removal (snapshot
    /// detail blobs and metadata blobs no longer referenced by any remaining snapshot) for the
    /// caller to garbage-collect.
    pub fn remove_snapshots(&mut self, uuids: &[SnapshotUuid]) -> Vec<String> {
        use crate::store::paths;
        use std::collections::BTreeSet;

        let mut orphaned = Vec::new();
        let mut removed_metas = BTreeSet::new();

        for uuid in uuids {
            if self.snapshots.iter().any(|record| record.uuid == *uuid) {
                orphaned.push(paths::snapshot_details(uuid));
            }
        }
        self.snapshots
            .retain(|record| !uuids.contains(&record.uuid));

        self.index_metadata_generations.retain(|_, references| {
            for uuid in uuids {
                if let Some(meta) = references.remove(uuid) {
                    removed_metas.insert(meta);
                }
            }
            !references.is_empty()
        });

        // Metadata blobs referenced by no remaining snapshot of any index are orphaned too.
        let still_referenced: BTreeSet<&String> = self
            .index_metadata_generations
            .values()
            .flat_map(|references| references.values())
            .collect();
        orphaned.extend(
            removed_metas
                .iter()
                .filter(|meta| !still_referenced.contains(meta))
                .map(|meta| paths::index_metadata(meta)),
        );

        orphaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IndexId;

    fn record(name: &str) -> SnapshotRecord {
        SnapshotRecord {
            uuid: SnapshotUuid::random(),
            name: name.to_owned(),
            state: SnapshotState::Success,
        }
    }

    #[test]
    fn body_does_not_carry_the_generation() {
        let data = RepositoryData::empty();
        let json = serde_json::to_string(&data).unwrap();
        assert!(!json.contains("generation\":-"));

        let parsed: RepositoryData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.generation, RepositoryGeneration::UNKNOWN);
    }

    #[test]
    fn add_and_remove_snapshot() {
        let index = IndexId::new("idx");
        let shard = ShardId::new(index.clone(), 0);

        let mut data = RepositoryData::empty();
        let added = record("snap-0");
        let uuid = added.uuid;

        data.add_snapshot(
            added,
            [(index.uuid, "meta0".to_owned())],
            [(shard.clone(), ShardGeneration(1))],
        );

        assert!(data.contains_name("snap-0"));
        assert_eq!(data.shard_generation(&shard), Some(ShardGeneration(1)));

        let orphaned = data.remove_snapshots(&[uuid]);
        assert!(!data.contains_name("snap-0"));
        // Both the snapshot detail blob and the now-unreferenced metadata blob are orphaned.
        assert!(orphaned.contains(&format!("snap-{uuid}.dat")));
        assert!(orphaned.contains(&"meta-meta0.dat".to_owned()));
        // Shard generations survive deletes; they track the shard, not the snapshot.
        assert_eq!(data.shard_generation(&shard), Some(ShardGeneration(1)));
    }
}
