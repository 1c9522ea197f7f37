use super::{DeletionUuid, RepositoryGeneration, SnapshotId};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DeletionState {
    /// Waiting for the in-progress snapshots it names to abort, or for the generation slot.
    Waiting,
    /// Actively rewriting the repository root metadata.
    Started,
}

/// One in-flight snapshot deletion batch, replicated as part of the cluster state.
#[derive(Clone, Debug)]
pub struct DeletionEntry {
    pub uuid: DeletionUuid,
    pub repository: String,
    /// Resolved snapshot ids this batch removes. Non-empty.
    pub snapshots: Vec<SnapshotId>,
    pub state: DeletionState,
    pub start_time_millis: u64,
    pub repository_generation: RepositoryGeneration,
    /// Position in the per-repository operation FIFO, shared with snapshot entries.
    pub order: u64,
}

impl DeletionEntry {
    pub fn names(&self, uuid: &super::SnapshotUuid) -> bool {
        self.snapshots.iter().any(|id| id.uuid == *uuid)
    }

    /// Folds additional resolved snapshots into this batch, keeping the list deduplicated.
    pub fn fold(&mut self, snapshots: impl IntoIterator<Item = SnapshotId>) {
        for snapshot in snapshots {
            if !self.names(&snapshot.uuid) {
                self.snapshots.push(snapshot);
            }
        }
    }
}

/// Ordered registry of in-flight deletions, a custom section of the cluster state.
#[derive(Clone, Debug, Default)]
pub struct SnapshotDeletionsInProgress {
    entries: Vec<DeletionEntry>,
}

impl SnapshotDeletionsInProgress {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeletionEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeletionEntry> {
        self.entries.iter_mut()
    }

    pub fn for_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> impl Iterator<Item = &'a DeletionEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.repository == repository)
    }

    pub fn get(&self, uuid: &DeletionUuid) -> Option<&DeletionEntry> {
        self.entries.iter().find(|entry| entry.uuid == *uuid)
    }

    pub fn get_mut(&mut self, uuid: &DeletionUuid) -> Option<&mut DeletionEntry> {
        self.entries.iter_mut().find(|entry| entry.uuid == *uuid)
    }

    /// The `Waiting` batch for the repository that new delete requests fold into, if any.
    /// Batches that already `Started` rewriting metadata are closed.
    pub fn foldable_mut(&mut self, repository: &str) -> Option<&mut DeletionEntry> {
        self.entries.iter_mut().find(|entry| {
            entry.repository == repository && entry.state == DeletionState::Waiting
        })
    }

    pub fn insert(&mut self, entry: DeletionEntry) {
        debug_assert!(!entry.snapshots.is_empty());
        self.entries.push(entry);
    }

    pub fn remove(&mut self, uuid: &DeletionUuid) -> Option<DeletionEntry> {
        let index = self.entries.iter().position(|entry| entry.uuid == *uuid)?;
        Some(self.entries.remove(index))
    }

    pub fn retain(&mut self, f: impl FnMut(&DeletionEntry) -> bool) {
        self.entries.retain(f);
    }
}
