//! The replicated data model: the two in-progress registries, repository metadata and the
//! supporting id types. Everything here is a value; mutation happens only on the master's
//! cluster-state update queue.

mod cluster_state;
mod deletion;
mod entry;
mod id;
mod info;
mod repository;
mod routing;
mod shard;
mod shutdown;

pub use self::{
    cluster_state::ClusterState,
    deletion::{DeletionEntry, DeletionState, SnapshotDeletionsInProgress},
    entry::{EntryState, SnapshotEntry, SnapshotsInProgress},
    id::{
        DeletionUuid, IndexId, IndexUuid, NodeId, ShardGeneration, ShardId, SnapshotId,
        SnapshotUuid,
    },
    info::{ShardFailure, SnapshotInfo, SnapshotState},
    repository::{
        QuarantineReason, RepositoriesMetadata, RepositoryGeneration, RepositoryMetadata,
        RepositorySettings,
    },
    routing::{IndexRouting, PrimaryLookup, RoutingTable},
    shard::{ShardSnapshotStatus, ShardState},
    shutdown::{NodeShutdownKind, NodeShutdownMetadata, NodesShutdownMetadata},
};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
