use super::{EntryState, IndexId, NodeId, ShardId, SnapshotEntry, SnapshotId};
use serde::{Deserialize, Serialize};

/// Client-visible snapshot state, also the persisted state inside `snap-{uuid}.dat` and the
/// root metadata records.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum SnapshotState {
    InProgress,
    Success,
    Partial,
    Failed,
}

impl SnapshotState {
    pub fn is_completed(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl From<EntryState> for SnapshotState {
    fn from(state: EntryState) -> Self {
        match state {
            EntryState::Init | EntryState::Started => Self::InProgress,
            EntryState::Success => Self::Success,
            EntryState::Partial => Self::Partial,
            // An aborted create is recorded and reported as failed.
            EntryState::Failed | EntryState::Aborted => Self::Failed,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardFailure {
    pub shard: ShardId,
    pub node: Option<NodeId>,
    pub reason: String,
}

/// The exit value of a snapshot create and the payload of `snap-{uuid}.dat`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot: SnapshotId,
    pub state: SnapshotState,
    pub indices: Vec<IndexId>,
    pub start_time_millis: u64,
    pub end_time_millis: Option<u64>,
    pub total_shards: u32,
    pub failures: Vec<ShardFailure>,
}

impl SnapshotInfo {
    /// Info for an entry still in flight.
    pub fn in_progress(entry: &SnapshotEntry) -> Self {
        Self {
            snapshot: entry.snapshot.clone(),
            state: SnapshotState::InProgress,
            indices: entry.indices.clone(),
            start_time_millis: entry.start_time_millis,
            end_time_millis: None,
            total_shards: entry.shards.len() as u32,
            failures: Vec::new(),
        }
    }

    /// Info for an entry that completed and is being finalized.
    pub fn completed(entry: &SnapshotEntry, end_time_millis: u64) -> Self {
        let failures = entry
            .shard_failures()
            .map(|(shard, status)| ShardFailure {
                shard: shard.clone(),
                node: status.node.clone(),
                reason: status
                    .failure
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_owned()),
            })
            .collect();

        Self {
            snapshot: entry.snapshot.clone(),
            state: entry.completed_state().into(),
            indices: entry.indices.clone(),
            start_time_millis: entry.start_time_millis,
            end_time_millis: Some(end_time_millis),
            total_shards: entry.shards.len() as u32,
            failures,
        }
    }

    pub fn failed_shards(&self) -> u32 {
        self.failures.len() as u32
    }
}
