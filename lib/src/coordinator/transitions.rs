//! Pure transitions over the cluster state. Everything here runs on the master's single-threaded
//! update queue; no I/O, no locks. Side effects are described, never executed.

use crate::{
    protocol::{
        ClusterState, DeletionState, DeletionUuid, EntryState, IndexId, NodeId,
        NodesShutdownMetadata, PrimaryLookup, RepositoryGeneration, RoutingTable, ShardGeneration,
        ShardId, ShardSnapshotStatus, ShardState, SnapshotUuid,
    },
    repository::RepositoryData,
};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// Which entry owns a repository's next root metadata write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FinalizeTarget {
    Snapshot(SnapshotUuid),
    Deletion(DeletionUuid),
}

/// Work the update queue must hand off after publishing a new state.
#[derive(Debug)]
pub(crate) enum SideEffect {
    /// Tell a data node to stop an upload.
    AbortShard {
        node: NodeId,
        snapshot: SnapshotUuid,
        shard: ShardId,
    },
    /// Load repository data to assign shards of an entry that was queued behind a deletion.
    LoadForAssign {
        repository: String,
        snapshot: SnapshotUuid,
    },
    /// Run the root metadata write for the entry holding the generation slot.
    Finalize {
        repository: String,
        target: FinalizeTarget,
        from: RepositoryGeneration,
    },
    /// Resolve whether a finalization inherited from a previous master committed, before
    /// dispatching anything else for the repository.
    Probe { repository: String },
}

/// Master-local dispatch bookkeeping. Deliberately *not* part of the replicated state: a new
/// master starts with empty trackers and re-derives everything from the registries.
#[derive(Default)]
pub(crate) struct Trackers {
    /// Repositories with an in-flight root metadata write.
    pub finalizing: HashSet<String>,
    /// Entries with an in-flight load-for-assignment.
    pub assigning: HashSet<SnapshotUuid>,
    /// Repositories with an in-flight generation probe.
    pub probing: HashSet<String>,
}

/// Places one shard: routing decides the node, shutdown markers veto nodes that are being
/// removed from the cluster.
fn place(
    routing: &RoutingTable,
    shutdowns: &NodesShutdownMetadata,
    shard: &ShardId,
    generation: ShardGeneration,
) -> ShardSnapshotStatus {
    match routing.primary(shard) {
        PrimaryLookup::Assigned(node) if !shutdowns.pauses_shard_snapshots(&node) => {
            ShardSnapshotStatus::init(node, generation)
        }
        PrimaryLookup::Assigned(_) | PrimaryLookup::Unassigned => {
            ShardSnapshotStatus::waiting(Some(generation))
        }
        PrimaryLookup::Gone => ShardSnapshotStatus::missing("no routing for shard"),
    }
}

/// Builds the initial shard map of a new entry from the routing table and the repository data
/// the admission path loaded.
pub(crate) fn assign_initial_shards(
    state: &ClusterState,
    repository: &str,
    indices: &[IndexId],
    data: &RepositoryData,
) -> IndexMap<ShardId, ShardSnapshotStatus> {
    let deletion_in_flight = state.deletions.for_repository(repository).next().is_some();
    let mut shards = IndexMap::new();

    for index in indices {
        let Some(routing) = state.routing.index(&index.name) else {
            continue;
        };

        for number in 0..routing.shard_count() {
            let shard = ShardId::new(index.clone(), number);
            let known = data.shard_generation(&shard);

            let status = if deletion_in_flight || shard_busy(state, repository, &shard) {
                ShardSnapshotStatus::queued(known)
            } else {
                place(
                    &state.routing,
                    &state.shutdowns,
                    &shard,
                    known.unwrap_or_default(),
                )
            };

            shards.insert(shard, status);
        }
    }

    shards
}

fn shard_busy(state: &ClusterState, repository: &str, shard: &ShardId) -> bool {
    state.snapshots.for_repository(repository).any(|entry| {
        entry
            .shards
            .get(shard)
            .map(|status| !status.is_terminal())
            .unwrap_or(false)
    })
}

/// Applies a shard status report from a data node. Reports for entries that are gone or shards
/// that are already terminal are dropped, which is what makes retransmission safe.
pub(crate) fn apply_shard_update(
    state: &mut ClusterState,
    snapshot: &SnapshotUuid,
    shard: &ShardId,
    incoming: ShardSnapshotStatus,
) -> bool {
    let Some(entry) = state.snapshots.get_mut(snapshot) else {
        return false;
    };
    let Some(current) = entry.shards.get_mut(shard) else {
        return false;
    };
    if current.is_terminal() {
        return false;
    }

    *current = match (current.state, incoming.state) {
        (_, ShardState::Success | ShardState::Failed) => incoming,
        // A pause that raced with an abort resolves the abort: the upload did stop.
        (ShardState::Aborted, ShardState::PausedForNodeRemoval) => {
            ShardSnapshotStatus::failed(incoming.node, "aborted by deletion")
        }
        (_, ShardState::PausedForNodeRemoval) => incoming,
        // Nodes only report success, failure or pause.
        _ => return false,
    };

    true
}

/// Flips an entry to `Aborted`. Shards with a possibly-running upload go to `Aborted` and wait
/// for the node's acknowledgement; shards that cannot have an upload running fail in place.
pub(crate) fn abort_entry(
    state: &mut ClusterState,
    snapshot: &SnapshotUuid,
    effects: &mut Vec<SideEffect>,
) {
    let Some(entry) = state.snapshots.get_mut(snapshot) else {
        return;
    };
    if entry.state == EntryState::Aborted || entry.state.is_terminal() {
        return;
    }
    entry.state = EntryState::Aborted;

    tracing::info!(snapshot = %entry.snapshot, repo = %entry.repository, "aborting snapshot");

    for (shard, status) in entry.shards.iter_mut() {
        match status.state {
            ShardState::Init => {
                let node = status.node.clone();
                *status = status.clone().aborted();
                if let Some(node) = node {
                    effects.push(SideEffect::AbortShard {
                        node,
                        snapshot: entry.snapshot.uuid,
                        shard: shard.clone(),
                    });
                }
            }
            ShardState::Waiting | ShardState::Queued | ShardState::PausedForNodeRemoval => {
                *status = ShardSnapshotStatus::failed(status.node.clone(), "aborted by deletion");
            }
            ShardState::Success
            | ShardState::Failed
            | ShardState::Missing
            | ShardState::Aborted => (),
        }
    }
}

/// Fails every shard that depended on a node that left the cluster.
pub(crate) fn apply_node_left(state: &mut ClusterState, node: &NodeId) {
    state.routing.remove_node(node);

    for entry in state.snapshots.iter_mut() {
        for status in entry.shards.values_mut() {
            if status.node.as_ref() != Some(node) {
                continue;
            }
            match status.state {
                ShardState::Init | ShardState::Aborted | ShardState::PausedForNodeRemoval => {
                    *status =
                        ShardSnapshotStatus::failed(Some(node.clone()), "node left the cluster");
                }
                _ => (),
            }
        }
    }
}

/// One full reconciliation pass. Runs after every mutation: re-places waiting and paused
/// shards, promotes queued shards behind finished holders, rolls entries and deletions
/// forward and hands out generation slots. Idempotent by construction; a new master runs it
/// over inherited state to resume exactly where the old one stopped.
pub(crate) fn reconcile(state: &mut ClusterState, trackers: &mut Trackers) -> Vec<SideEffect> {
    let mut effects = Vec::new();

    replace_movable_shards(state);
    promote_queued_shards(state, &mut effects, &trackers.assigning);
    roll_entries(state);
    promote_deletions(state);
    redrive_aborts(state, &mut effects);
    dispatch_generation_slots(state, trackers, &mut effects);

    effects
}

/// Re-evaluates `Waiting` and `PausedForNodeRemoval` shards against the current routing and
/// shutdown markers.
fn replace_movable_shards(state: &mut ClusterState) {
    let routing = state.routing.clone();
    let shutdowns = state.shutdowns.clone();

    for entry in state.snapshots.iter_mut() {
        if entry.state == EntryState::Aborted {
            continue;
        }

        for (shard, status) in entry.shards.iter_mut() {
            if !matches!(
                status.state,
                ShardState::Waiting | ShardState::PausedForNodeRemoval
            ) {
                continue;
            }

            let generation = status.generation.unwrap_or_default();
            match routing.primary(shard) {
                PrimaryLookup::Gone => {
                    *status = ShardSnapshotStatus::missing("no routing for shard");
                }
                PrimaryLookup::Assigned(node) if !shutdowns.pauses_shard_snapshots(&node) => {
                    // For a paused shard this covers both resolutions: the primary moved, or
                    // the shutdown marker was cleared while the shard never left.
                    *status = ShardSnapshotStatus::init(node, generation);
                }
                // Still nowhere to go; keep waiting / paused.
                PrimaryLookup::Assigned(_) | PrimaryLookup::Unassigned => (),
            }
        }
    }
}

/// Promotes `Queued` shards whose older holder reached a terminal state, handing over the
/// generation the holder produced. Shards queued behind a deletion (no generation known at
/// all) need fresh repository data first; those are dispatched as
/// [`SideEffect::LoadForAssign`].
fn promote_queued_shards(
    state: &mut ClusterState,
    effects: &mut Vec<SideEffect>,
    assigning: &HashSet<SnapshotUuid>,
) {
    struct Holder {
        busy: bool,
        produced: Option<ShardGeneration>,
    }

    let deleting: HashSet<String> = state
        .deletions
        .iter()
        .map(|entry| entry.repository.clone())
        .collect();

    let mut order: Vec<(u64, SnapshotUuid)> = state
        .snapshots
        .iter()
        .map(|entry| (entry.order, entry.snapshot.uuid))
        .collect();
    order.sort_unstable();

    let mut holders: HashMap<(String, ShardId), Holder> = HashMap::new();
    let mut promotions: Vec<(SnapshotUuid, ShardId, ShardGeneration)> = Vec::new();
    let mut needs_assignment: Vec<(String, SnapshotUuid)> = Vec::new();

    for (_, uuid) in &order {
        let Some(entry) = state.snapshots.get(uuid) else {
            continue;
        };
        let deletion_in_flight = deleting.contains(&entry.repository);
        let mut entry_needs_data = false;

        for (shard, status) in &entry.shards {
            let key = (entry.repository.clone(), shard.clone());
            let holder = holders.entry(key).or_insert(Holder {
                busy: false,
                produced: None,
            });

            match status.state {
                ShardState::Queued if !holder.busy => {
                    if deletion_in_flight {
                        // Keep queued until the deletion drains.
                    } else if let Some(generation) = holder.produced.or(status.generation) {
                        promotions.push((*uuid, shard.clone(), generation));
                    } else {
                        entry_needs_data = true;
                    }
                    holder.busy = true;
                }
                ShardState::Queued => (),
                ShardState::Success => {
                    holder.produced = status.generation.or(holder.produced);
                }
                other if !other.is_terminal() => {
                    holder.busy = true;
                }
                _ => (),
            }
        }

        if entry_needs_data && !assigning.contains(uuid) {
            needs_assignment.push((entry.repository.clone(), *uuid));
        }
    }

    let routing = state.routing.clone();
    let shutdowns = state.shutdowns.clone();

    for (snapshot, shard, generation) in promotions {
        let status = place(&routing, &shutdowns, &shard, generation);
        if let Some(entry) = state.snapshots.get_mut(&snapshot) {
            if let Some(slot) = entry.shards.get_mut(&shard) {
                *slot = status;
            }
        }
    }

    for (repository, snapshot) in needs_assignment {
        effects.push(SideEffect::LoadForAssign {
            repository,
            snapshot,
        });
    }
}

/// Promotes entries out of `Init` and rolls completed entries to their terminal state.
fn roll_entries(state: &mut ClusterState) {
    for entry in state.snapshots.iter_mut() {
        if entry.state == EntryState::Init && entry.all_shards_placed() {
            entry.state = EntryState::Started;
        }

        if matches!(entry.state, EntryState::Init | EntryState::Started) && entry.is_completed() {
            entry.state = entry.completed_state();
        }
    }
}

/// `Waiting -> Started` once no named in-progress snapshot remains non-terminal.
fn promote_deletions(state: &mut ClusterState) {
    let snapshots = state.snapshots.clone();

    for deletion in state.deletions.iter_mut() {
        if deletion.state != DeletionState::Waiting {
            continue;
        }

        let blocked = deletion.snapshots.iter().any(|id| {
            snapshots
                .get(&id.uuid)
                .map(|entry| !entry.is_completed())
                .unwrap_or(false)
        });

        if !blocked {
            deletion.state = DeletionState::Started;
        }
    }
}

/// Re-emits abort calls for entries that are aborted but still waiting for node
/// acknowledgements. A no-op on nodes where nothing is running; this is what makes the abort
/// path safe to replay after a master failover.
fn redrive_aborts(state: &ClusterState, effects: &mut Vec<SideEffect>) {
    for entry in state.snapshots.iter() {
        if entry.state != EntryState::Aborted {
            continue;
        }

        for (shard, status) in &entry.shards {
            if status.state == ShardState::Aborted {
                if let Some(node) = &status.node {
                    effects.push(SideEffect::AbortShard {
                        node: node.clone(),
                        snapshot: entry.snapshot.uuid,
                        shard: shard.clone(),
                    });
                }
            }
        }
    }
}

/// The generation arbiter: per repository, at most one in-flight root metadata write, owned by
/// the oldest entry (across both registries) that is ready for it.
fn dispatch_generation_slots(
    state: &mut ClusterState,
    trackers: &mut Trackers,
    effects: &mut Vec<SideEffect>,
) {
    let repositories: Vec<String> = state
        .repositories
        .iter()
        .map(|metadata| metadata.name.clone())
        .collect();

    for repository in repositories {
        let Some(metadata) = state.repositories.get(&repository) else {
            continue;
        };

        if metadata.is_quarantined()
            || trackers.finalizing.contains(&repository)
            || trackers.probing.contains(&repository)
        {
            continue;
        }

        let generation = metadata.generation;
        let pending = metadata.pending_generation;

        // The generation is seeded by the first admission load; nothing to arbitrate before
        // that.
        if generation.is_sentinel() {
            continue;
        }

        // A previous master may have left a finalization in an unknown state. Resolve that
        // before touching the repository again.
        if !pending.is_sentinel() && pending > generation {
            trackers.probing.insert(repository.clone());
            effects.push(SideEffect::Probe {
                repository: repository.clone(),
            });
            continue;
        }

        let Some(target) = next_slot_holder(state, &repository) else {
            continue;
        };
        let order = order_of(state, &target);

        if let Some(metadata) = state.repositories.get_mut(&repository) {
            metadata.pending_generation = generation.next();
            metadata.pending_order = order;
        }

        trackers.finalizing.insert(repository.clone());
        effects.push(SideEffect::Finalize {
            repository,
            target,
            from: generation,
        });
    }
}

/// The oldest entry across both registries that is ready to mutate the repository's root
/// metadata.
pub(crate) fn next_slot_holder(state: &ClusterState, repository: &str) -> Option<FinalizeTarget> {
    let ready_snapshots = state
        .snapshots
        .for_repository(repository)
        .filter(|entry| entry.is_completed())
        .map(|entry| (entry.order, FinalizeTarget::Snapshot(entry.snapshot.uuid)));

    // A deletion only takes the slot once every snapshot it names has left the registry;
    // aborted creates it names must write their own (failed) record first so the deletion
    // can remove it.
    let ready_deletions = state
        .deletions
        .for_repository(repository)
        .filter(|entry| {
            entry.state == DeletionState::Started
                && entry
                    .snapshots
                    .iter()
                    .all(|id| state.snapshots.get(&id.uuid).is_none())
        })
        .map(|entry| (entry.order, FinalizeTarget::Deletion(entry.uuid)));

    ready_snapshots
        .chain(ready_deletions)
        .min_by_key(|(order, _)| *order)
        .map(|(_, target)| target)
}

fn order_of(state: &ClusterState, target: &FinalizeTarget) -> Option<u64> {
    match target {
        FinalizeTarget::Snapshot(uuid) => state.snapshots.get(uuid).map(|entry| entry.order),
        FinalizeTarget::Deletion(uuid) => state.deletions.get(uuid).map(|entry| entry.order),
    }
}

/// The entry (in either registry) occupying the given FIFO position.
pub(crate) fn target_by_order(
    state: &ClusterState,
    repository: &str,
    order: u64,
) -> Option<FinalizeTarget> {
    state
        .snapshots
        .for_repository(repository)
        .find(|entry| entry.order == order)
        .map(|entry| FinalizeTarget::Snapshot(entry.snapshot.uuid))
        .or_else(|| {
            state
                .deletions
                .for_repository(repository)
                .find(|entry| entry.order == order)
                .map(|entry| FinalizeTarget::Deletion(entry.uuid))
        })
}
