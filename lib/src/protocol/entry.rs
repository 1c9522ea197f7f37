use super::{
    IndexId, RepositoryGeneration, ShardId, ShardSnapshotStatus, ShardState, SnapshotId,
    SnapshotUuid,
};
use indexmap::IndexMap;

/// Lifecycle of an in-progress snapshot entry. Never regresses.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EntryState {
    /// Inserted, some shards still waiting for a node assignment.
    Init,
    /// Every shard is assigned, missing or queued; uploads may be running.
    Started,
    Success,
    Partial,
    Failed,
    /// A deletion named this entry. Reached from any non-terminal state.
    Aborted,
}

impl EntryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Partial | Self::Failed)
    }
}

/// One in-flight snapshot create, replicated to every node as part of the cluster state.
#[derive(Clone, Debug)]
pub struct SnapshotEntry {
    pub snapshot: SnapshotId,
    pub repository: String,
    pub state: EntryState,
    pub indices: Vec<IndexId>,
    pub shards: IndexMap<ShardId, ShardSnapshotStatus>,
    /// Whether missing or failed shards degrade the snapshot to `Partial` instead of failing it.
    pub partial: bool,
    pub start_time_millis: u64,
    /// The repository generation this entry observed when it was enqueued.
    pub repository_generation: RepositoryGeneration,
    /// Position in the per-repository operation FIFO, shared with deletion entries.
    pub order: u64,
}

impl SnapshotEntry {
    /// An entry is completed once every shard reached a terminal state. Completion makes it
    /// eligible for the repository's next generation slot.
    pub fn is_completed(&self) -> bool {
        self.shards.values().all(|status| status.is_terminal())
    }

    /// The state the entry finalizes with. Only meaningful once [`Self::is_completed`].
    pub fn completed_state(&self) -> EntryState {
        if self.state == EntryState::Aborted {
            return EntryState::Aborted;
        }

        if self
            .shards
            .values()
            .any(|status| status.state.is_unsuccessful())
        {
            if self.partial {
                EntryState::Partial
            } else {
                EntryState::Failed
            }
        } else {
            EntryState::Success
        }
    }

    /// Whether all shards have been assigned a node or marked missing/queued, which is what
    /// promotes the entry out of `Init`.
    pub fn all_shards_placed(&self) -> bool {
        self.shards.values().all(|status| {
            status.is_terminal()
                || matches!(
                    status.state,
                    ShardState::Init
                        | ShardState::Queued
                        | ShardState::Aborted
                        | ShardState::PausedForNodeRemoval
                )
        })
    }

    pub fn shard_failures(&self) -> impl Iterator<Item = (&ShardId, &ShardSnapshotStatus)> {
        self.shards
            .iter()
            .filter(|(_, status)| status.state.is_unsuccessful())
    }
}

/// Ordered registry of in-flight snapshot creates, a custom section of the cluster state.
/// Insertion order is preserved; per repository it is the source of truth for which operation
/// owns the next generation slot.
#[derive(Clone, Debug, Default)]
pub struct SnapshotsInProgress {
    entries: Vec<SnapshotEntry>,
}

impl SnapshotsInProgress {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SnapshotEntry> {
        self.entries.iter_mut()
    }

    pub fn for_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> impl Iterator<Item = &'a SnapshotEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.repository == repository)
    }

    pub fn get(&self, uuid: &SnapshotUuid) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|entry| entry.snapshot.uuid == *uuid)
    }

    pub fn get_mut(&mut self, uuid: &SnapshotUuid) -> Option<&mut SnapshotEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.snapshot.uuid == *uuid)
    }

    pub fn contains_name(&self, repository: &str, name: &str) -> bool {
        self.for_repository(repository)
            .any(|entry| entry.snapshot.name == name)
    }

    /// Appends the entry to the tail of the registry FIFO.
    pub fn insert(&mut self, entry: SnapshotEntry) {
        debug_assert!(!self.contains_name(&entry.repository, &entry.snapshot.name));
        self.entries.push(entry);
    }

    pub fn remove(&mut self, uuid: &SnapshotUuid) -> Option<SnapshotEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.snapshot.uuid == *uuid)?;
        Some(self.entries.remove(index))
    }

    pub fn retain(&mut self, f: impl FnMut(&SnapshotEntry) -> bool) {
        self.entries.retain(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NodeId, ShardGeneration};

    fn entry_with_shards(statuses: Vec<ShardSnapshotStatus>) -> SnapshotEntry {
        let index = IndexId::new("idx");
        let shards = statuses
            .into_iter()
            .enumerate()
            .map(|(i, status)| (ShardId::new(index.clone(), i as u32), status))
            .collect();

        SnapshotEntry {
            snapshot: SnapshotId::new("snap"),
            repository: "repo".to_owned(),
            state: EntryState::Started,
            indices: vec![index],
            shards,
            partial: false,
            start_time_millis: 0,
            repository_generation: RepositoryGeneration(0),
            order: 0,
        }
    }

    #[test]
    fn rollup_success() {
        let entry = entry_with_shards(vec![
            ShardSnapshotStatus::success(NodeId::from("a"), ShardGeneration(1)),
            ShardSnapshotStatus::success(NodeId::from("b"), ShardGeneration(1)),
        ]);
        assert!(entry.is_completed());
        assert_eq!(entry.completed_state(), EntryState::Success);
    }

    #[test]
    fn rollup_failed_without_partial() {
        let entry = entry_with_shards(vec![
            ShardSnapshotStatus::success(NodeId::from("a"), ShardGeneration(1)),
            ShardSnapshotStatus::failed(Some(NodeId::from("b")), "disk full"),
        ]);
        assert!(entry.is_completed());
        assert_eq!(entry.completed_state(), EntryState::Failed);
    }

    #[test]
    fn rollup_partial() {
        let mut entry = entry_with_shards(vec![
            ShardSnapshotStatus::success(NodeId::from("a"), ShardGeneration(1)),
            ShardSnapshotStatus::missing("index closed"),
        ]);
        entry.partial = true;
        assert!(entry.is_completed());
        assert_eq!(entry.completed_state(), EntryState::Partial);
    }

    #[test]
    fn aborted_entry_stays_aborted() {
        let mut entry = entry_with_shards(vec![ShardSnapshotStatus::failed(
            Some(NodeId::from("a")),
            "aborted",
        )]);
        entry.state = EntryState::Aborted;
        assert!(entry.is_completed());
        assert_eq!(entry.completed_state(), EntryState::Aborted);
    }

    #[test]
    fn incomplete_while_any_shard_active() {
        let entry = entry_with_shards(vec![
            ShardSnapshotStatus::success(NodeId::from("a"), ShardGeneration(1)),
            ShardSnapshotStatus::init(NodeId::from("b"), ShardGeneration(0)),
        ]);
        assert!(!entry.is_completed());
    }
}
