//! The cluster-state loop: a single-writer actor on the elected master that owns the two
//! registries, applies pure transitions, publishes the resulting states and hands side effects
//! (uploads to abort, root metadata writes) to a worker pool. Dropping the [`Coordinator`]
//! models master loss: outstanding side effects are cancelled and request waiters complete
//! with a retriable error.

mod deletions;
mod transitions;

#[cfg(test)]
mod tests;

pub(crate) use self::transitions::FinalizeTarget;

use self::transitions::{SideEffect, Trackers};
use crate::{
    error::{Error, Result},
    protocol::{
        now_millis, ClusterState, DeletionEntry, DeletionState, DeletionUuid, EntryState, IndexId,
        IndexRouting, NodeId, NodeShutdownKind, NodeShutdownMetadata, QuarantineReason,
        RepositoryGeneration, RepositoryMetadata, RepositorySettings, ShardGeneration, ShardId,
        ShardSnapshotStatus, ShardState, SnapshotEntry, SnapshotId, SnapshotInfo, SnapshotUuid,
    },
    repository::{Repository, RepositoryData, SnapshotRecord},
    store::Registry,
    worker::NodeDirectory,
};
use futures_util::future;
use serde::Serialize;
use std::{collections::HashMap, io, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::Instrument;

/// How often a stalled admission (racing with an in-flight finalization) re-reads the
/// repository data, and how many times before giving up.
const ADMIT_RETRY_DELAY: Duration = Duration::from_millis(20);
const ADMIT_RETRY_LIMIT: u32 = 250;

pub(crate) type ReplyTx<T> = oneshot::Sender<Result<T>>;

#[derive(Clone, Debug)]
pub struct CreateOptions {
    /// Index names to snapshot; `None` snapshots every routed index.
    pub indices: Option<Vec<String>>,
    /// Whether missing or failed shards degrade the snapshot to partial instead of failing it.
    pub partial: bool,
    /// `false` resolves the request as soon as the entry is admitted.
    pub wait_for_completion: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            indices: None,
            partial: false,
            wait_for_completion: true,
        }
    }
}

pub(crate) enum Event {
    CreateSnapshot {
        repository: String,
        name: String,
        options: CreateOptions,
        reply: ReplyTx<SnapshotInfo>,
    },
    CreateAdmit {
        repository: String,
        name: String,
        options: CreateOptions,
        data: Result<RepositoryData>,
        attempt: u32,
        reply: ReplyTx<SnapshotInfo>,
    },
    DeleteSnapshots {
        repository: String,
        patterns: Vec<String>,
        reply: ReplyTx<()>,
    },
    DeleteAdmit {
        repository: String,
        patterns: Vec<String>,
        data: Result<RepositoryData>,
        attempt: u32,
        reply: ReplyTx<()>,
    },
    GetSnapshots {
        repository: String,
        patterns: Vec<String>,
        reply: ReplyTx<Vec<SnapshotInfo>>,
    },
    PutRepository {
        name: String,
        kind: String,
        settings: RepositorySettings,
        reply: ReplyTx<()>,
    },
    DeleteRepository {
        name: String,
        reply: ReplyTx<()>,
    },
    PutIndex {
        routing: IndexRouting,
    },
    RemoveIndex {
        name: String,
    },
    SetShutdown {
        node: NodeId,
        kind: NodeShutdownKind,
        reason: String,
    },
    ClearShutdown {
        node: NodeId,
    },
    NodeLeft {
        node: NodeId,
    },
    ShardUpdate {
        snapshot: SnapshotUuid,
        shard: ShardId,
        status: ShardSnapshotStatus,
    },
    AssignShards {
        repository: String,
        snapshot: SnapshotUuid,
        data: Result<RepositoryData>,
    },
    FinalizeDone {
        repository: String,
        target: FinalizeTarget,
        result: Result<FinalizeOutcome>,
    },
    Probed {
        repository: String,
        result: Result<RepositoryData>,
    },
    Reconcile,
}

pub(crate) struct FinalizeOutcome {
    new_generation: RepositoryGeneration,
    /// Set for snapshot finalizations; handed to the create waiters.
    info: Option<SnapshotInfo>,
    /// Set for deletion finalizations; blob paths to garbage-collect.
    orphaned: Vec<String>,
}

/// Cheap cloneable address of the coordinator's update queue.
#[derive(Clone)]
pub(crate) struct CoordinatorHandle {
    node: NodeId,
    tx: mpsc::UnboundedSender<Event>,
}

impl CoordinatorHandle {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Enqueues the event; `false` when the coordinator is gone.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// The running cluster-state loop of one elected master. Dropping it stops the loop, aborts
/// outstanding side effects and fails all request waiters with [`Error::MasterLost`].
pub struct Coordinator {
    handle: CoordinatorHandle,
    task: JoinHandle<()>,
}

impl Coordinator {
    /// Starts a coordinator over the given state: the initial empty state on a fresh cluster,
    /// or the last published state when taking over after a failover. The first thing the new
    /// master does is publish its mastership and reconcile, which re-drives every side effect
    /// whose completion the previous master may have taken with it.
    pub(crate) fn spawn(
        node: NodeId,
        mut state: ClusterState,
        state_tx: watch::Sender<ClusterState>,
        registry: Arc<Registry>,
        directory: NodeDirectory,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CoordinatorHandle {
            node: node.clone(),
            tx: tx.clone(),
        };

        state.master = Some(node.clone());

        let span = tracing::info_span!("coordinator", master = %node);
        let actor = Actor {
            node,
            state,
            state_tx,
            registry,
            directory,
            events_tx: tx.clone(),
            tasks: JoinSet::new(),
            trackers: Trackers::default(),
            create_waiters: HashMap::new(),
            delete_waiters: HashMap::new(),
        };

        let task = tokio::spawn(actor.run(rx).instrument(span));
        tx.send(Event::Reconcile).ok();

        Self { handle, task }
    }

    pub(crate) fn handle(&self) -> &CoordinatorHandle {
        &self.handle
    }

    /// Aborts the update loop and waits for it to actually stop, so a successor can start
    /// publishing without racing it. Outstanding side effects die with the loop.
    pub(crate) async fn shutdown(mut self) {
        self.task.abort();
        (&mut self.task).await.ok();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Actor {
    node: NodeId,
    state: ClusterState,
    state_tx: watch::Sender<ClusterState>,
    registry: Arc<Registry>,
    directory: NodeDirectory,
    events_tx: mpsc::UnboundedSender<Event>,
    /// Side-effect tasks. Dropped (and thereby aborted) together with the actor on master
    /// loss.
    tasks: JoinSet<()>,
    trackers: Trackers,
    create_waiters: HashMap<SnapshotUuid, Vec<ReplyTx<SnapshotInfo>>>,
    delete_waiters: HashMap<DeletionUuid, Vec<ReplyTx<()>>>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        tracing::info!(node = %self.node, "elected master");
        self.publish();

        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
    }

    fn publish(&mut self) {
        self.state.version += 1;
        self.state_tx.send_replace(self.state.clone());
    }

    /// Common tail of every mutating handler: reconcile, publish, hand off side effects.
    fn finish(&mut self, mut effects: Vec<SideEffect>) {
        // Reap finished side-effect tasks so the set does not grow without bound.
        while self.tasks.try_join_next().is_some() {}

        effects.extend(transitions::reconcile(&mut self.state, &mut self.trackers));
        self.publish();
        self.run_effects(effects);
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::CreateSnapshot {
                repository,
                name,
                options,
                reply,
            } => self.on_create_snapshot(repository, name, options, reply),
            Event::CreateAdmit {
                repository,
                name,
                options,
                data,
                attempt,
                reply,
            } => self.on_create_admit(repository, name, options, data, attempt, reply),
            Event::DeleteSnapshots {
                repository,
                patterns,
                reply,
            } => self.on_delete_snapshots(repository, patterns, reply),
            Event::DeleteAdmit {
                repository,
                patterns,
                data,
                attempt,
                reply,
            } => self.on_delete_admit(repository, patterns, data, attempt, reply),
            Event::GetSnapshots {
                repository,
                patterns,
                reply,
            } => self.on_get_snapshots(repository, patterns, reply),
            Event::PutRepository {
                name,
                kind,
                settings,
                reply,
            } => self.on_put_repository(name, kind, settings, reply),
            Event::DeleteRepository { name, reply } => self.on_delete_repository(name, reply),
            Event::PutIndex { routing } => {
                self.state.routing.insert(routing);
                self.finish(Vec::new());
            }
            Event::RemoveIndex { name } => {
                self.state.routing.remove(&name);
                self.finish(Vec::new());
            }
            Event::SetShutdown { node, kind, reason } => {
                self.state.shutdowns.insert(
                    node,
                    NodeShutdownMetadata {
                        kind,
                        reason,
                        started_at_millis: now_millis(),
                    },
                );
                self.finish(Vec::new());
            }
            Event::ClearShutdown { node } => {
                self.state.shutdowns.remove(&node);
                self.finish(Vec::new());
            }
            Event::NodeLeft { node } => {
                transitions::apply_node_left(&mut self.state, &node);
                self.finish(Vec::new());
            }
            Event::ShardUpdate {
                snapshot,
                shard,
                status,
            } => {
                if transitions::apply_shard_update(&mut self.state, &snapshot, &shard, status) {
                    self.finish(Vec::new());
                }
            }
            Event::AssignShards {
                repository,
                snapshot,
                data,
            } => self.on_assign_shards(repository, snapshot, data),
            Event::FinalizeDone {
                repository,
                target,
                result,
            } => self.on_finalize_done(repository, target, result),
            Event::Probed { repository, result } => self.on_probed(repository, result),
            Event::Reconcile => self.finish(Vec::new()),
        }
    }

    // --- admission -------------------------------------------------------------------------

    fn on_create_snapshot(
        &mut self,
        repository: String,
        name: String,
        options: CreateOptions,
        reply: ReplyTx<SnapshotInfo>,
    ) {
        if let Err(error) = self.check_repository(&repository) {
            reply.send(Err(error)).ok();
            return;
        }
        if self.state.snapshots.contains_name(&repository, &name) {
            reply
                .send(Err(Error::InvalidSnapshotName {
                    name,
                    reason: "snapshot with the same name is already in progress".to_owned(),
                }))
                .ok();
            return;
        }

        let target = repository.clone();
        self.spawn_admission_load(&target, 0, move |data, attempt| Event::CreateAdmit {
            repository,
            name,
            options,
            data,
            attempt,
            reply,
        });
    }

    fn on_create_admit(
        &mut self,
        repository: String,
        name: String,
        options: CreateOptions,
        data: Result<RepositoryData>,
        attempt: u32,
        reply: ReplyTx<SnapshotInfo>,
    ) {
        if let Err(error) = self.check_repository(&repository) {
            reply.send(Err(error)).ok();
            return;
        }

        let data = match self.accept_admission_data(&repository, data, attempt) {
            AdmissionData::Ready(data) => data,
            AdmissionData::Retry => {
                let target = repository.clone();
                self.spawn_admission_load(&target, attempt + 1, move |data, attempt| {
                    Event::CreateAdmit {
                        repository,
                        name,
                        options,
                        data,
                        attempt,
                        reply,
                    }
                });
                return;
            }
            AdmissionData::Failed(error) => {
                reply.send(Err(error)).ok();
                self.finish(Vec::new());
                return;
            }
        };

        if data.contains_name(&name) || self.state.snapshots.contains_name(&repository, &name) {
            reply
                .send(Err(Error::InvalidSnapshotName {
                    name,
                    reason: "snapshot with the same name already exists".to_owned(),
                }))
                .ok();
            // The admission load may have seeded the generation; publish that.
            self.finish(Vec::new());
            return;
        }

        let indices: Vec<IndexId> = match &options.indices {
            Some(names) => names
                .iter()
                .filter_map(|name| self.state.routing.index(name))
                .map(|routing| routing.id.clone())
                .collect(),
            None => self
                .state
                .routing
                .indices()
                .map(|routing| routing.id.clone())
                .collect(),
        };

        let shards = transitions::assign_initial_shards(&self.state, &repository, &indices, &data);
        let order = self.state.take_order();

        let entry = SnapshotEntry {
            snapshot: SnapshotId::new(name),
            repository: repository.clone(),
            state: EntryState::Init,
            indices,
            shards,
            partial: options.partial,
            start_time_millis: now_millis(),
            repository_generation: data.generation,
            order,
        };
        let uuid = entry.snapshot.uuid;

        tracing::info!(snapshot = %entry.snapshot, repo = %repository, shards = entry.shards.len(), "snapshot started");

        let early_reply = (!options.wait_for_completion).then(|| SnapshotInfo::in_progress(&entry));
        self.state.snapshots.insert(entry);

        match early_reply {
            Some(info) => {
                reply.send(Ok(info)).ok();
            }
            None => {
                self.create_waiters.entry(uuid).or_default().push(reply);
            }
        }

        self.finish(Vec::new());
    }

    fn on_delete_snapshots(
        &mut self,
        repository: String,
        patterns: Vec<String>,
        reply: ReplyTx<()>,
    ) {
        if let Err(error) = self.check_repository(&repository) {
            reply.send(Err(error)).ok();
            return;
        }

        let target = repository.clone();
        self.spawn_admission_load(&target, 0, move |data, attempt| Event::DeleteAdmit {
            repository,
            patterns,
            data,
            attempt,
            reply,
        });
    }

    fn on_delete_admit(
        &mut self,
        repository: String,
        patterns: Vec<String>,
        data: Result<RepositoryData>,
        attempt: u32,
        reply: ReplyTx<()>,
    ) {
        if let Err(error) = self.check_repository(&repository) {
            reply.send(Err(error)).ok();
            return;
        }

        let data = match self.accept_admission_data(&repository, data, attempt) {
            AdmissionData::Ready(data) => data,
            AdmissionData::Retry => {
                let target = repository.clone();
                self.spawn_admission_load(&target, attempt + 1, move |data, attempt| {
                    Event::DeleteAdmit {
                        repository,
                        patterns,
                        data,
                        attempt,
                        reply,
                    }
                });
                return;
            }
            AdmissionData::Failed(error) => {
                reply.send(Err(error)).ok();
                self.finish(Vec::new());
                return;
            }
        };

        let resolution = deletions::resolve(&self.state, &repository, &patterns, &data);

        if let Some(name) = resolution.unmatched.into_iter().next() {
            reply.send(Err(Error::SnapshotMissing(name))).ok();
            self.finish(Vec::new());
            return;
        }
        if resolution.snapshots.is_empty() {
            // A wildcard over nothing acknowledges immediately, with no generation change.
            reply.send(Ok(())).ok();
            self.finish(Vec::new());
            return;
        }

        let mut effects = Vec::new();
        for id in &resolution.snapshots {
            transitions::abort_entry(&mut self.state, &id.uuid, &mut effects);
        }

        let uuid = match self.state.deletions.foldable_mut(&repository) {
            Some(existing) => {
                tracing::debug!(deletion = %existing.uuid, repo = %repository, "folding into pending deletion batch");
                existing.fold(resolution.snapshots);
                existing.uuid
            }
            None => {
                let order = self.state.take_order();
                let entry = DeletionEntry {
                    uuid: DeletionUuid::random(),
                    repository: repository.clone(),
                    snapshots: resolution.snapshots,
                    state: DeletionState::Waiting,
                    start_time_millis: now_millis(),
                    repository_generation: data.generation,
                    order,
                };
                let uuid = entry.uuid;
                tracing::info!(deletion = %uuid, repo = %repository, snapshots = entry.snapshots.len(), "deletion started");
                self.state.deletions.insert(entry);
                uuid
            }
        };

        self.delete_waiters.entry(uuid).or_default().push(reply);
        self.finish(effects);
    }

    fn on_get_snapshots(
        &mut self,
        repository: String,
        patterns: Vec<String>,
        reply: ReplyTx<Vec<SnapshotInfo>>,
    ) {
        if let Err(error) = self.check_repository(&repository) {
            reply.send(Err(error)).ok();
            return;
        }

        let mut current = Vec::new();
        let mut store_patterns = Vec::new();
        for pattern in patterns {
            if pattern == "_current" {
                current.extend(
                    self.state
                        .snapshots
                        .for_repository(&repository)
                        .map(SnapshotInfo::in_progress),
                );
            } else {
                store_patterns.push(pattern);
            }
        }

        if store_patterns.is_empty() {
            reply.send(Ok(current)).ok();
            return;
        }

        let Some(repo) = self.open_repository(&repository) else {
            reply.send(Err(Error::RepositoryMissing(repository))).ok();
            return;
        };

        self.tasks.spawn(async move {
            reply
                .send(read_snapshots(&repo, &store_patterns, current).await)
                .ok();
        });
    }

    fn on_put_repository(
        &mut self,
        name: String,
        kind: String,
        settings: RepositorySettings,
        reply: ReplyTx<()>,
    ) {
        if self.state.repository_in_use(&name) {
            reply.send(Err(Error::RepositoryInUse(name))).ok();
            return;
        }
        if let Err(error) = self.registry.open(&kind, &settings) {
            reply.send(Err(error)).ok();
            return;
        }

        tracing::info!(repo = %name, %kind, "repository registered");
        self.state
            .repositories
            .insert(RepositoryMetadata::new(name, kind, settings));
        reply.send(Ok(())).ok();
        self.finish(Vec::new());
    }

    fn on_delete_repository(&mut self, name: String, reply: ReplyTx<()>) {
        if self.state.repository_in_use(&name) {
            reply.send(Err(Error::RepositoryInUse(name))).ok();
            return;
        }

        match self.state.repositories.remove(&name) {
            Some(_) => {
                tracing::info!(repo = %name, "repository unregistered");
                reply.send(Ok(())).ok();
                self.finish(Vec::new());
            }
            None => {
                reply.send(Err(Error::RepositoryMissing(name))).ok();
            }
        }
    }

    // --- assignment and finalization -------------------------------------------------------

    fn on_assign_shards(
        &mut self,
        repository: String,
        snapshot: SnapshotUuid,
        data: Result<RepositoryData>,
    ) {
        self.trackers.assigning.remove(&snapshot);

        if self.state.snapshots.get(&snapshot).is_none() {
            return;
        }

        match data {
            Ok(data) => {
                self.seed_generation(&repository, &data);

                if let Some(entry) = self.state.snapshots.get_mut(&snapshot) {
                    entry.repository_generation = data.generation;

                    // Fill in the generations the queued shards were missing; the reconcile
                    // pass does the actual placement.
                    let known: Vec<(ShardId, Option<ShardGeneration>)> = entry
                        .shards
                        .iter()
                        .filter(|(_, status)| {
                            status.state == ShardState::Queued && status.generation.is_none()
                        })
                        .map(|(shard, _)| (shard.clone(), data.shard_generation(shard)))
                        .collect();

                    for (shard, generation) in known {
                        if let Some(status) = entry.shards.get_mut(&shard) {
                            status.generation = Some(generation.unwrap_or_default());
                        }
                    }
                }

                self.finish(Vec::new());
            }
            Err(error) => {
                let quarantining = is_repository_fatal(&error);
                let replicated = self.on_repository_error(&repository, &error);

                if !quarantining {
                    if let Some(entry) = self.state.snapshots.remove(&snapshot) {
                        self.fail_create_waiters(&entry.snapshot.uuid, &replicated);
                    }
                }
                self.finish(Vec::new());
            }
        }
    }

    fn on_finalize_done(
        &mut self,
        repository: String,
        target: FinalizeTarget,
        result: Result<FinalizeOutcome>,
    ) {
        self.trackers.finalizing.remove(&repository);

        match result {
            Ok(outcome) => {
                if let Some(metadata) = self.state.repositories.get_mut(&repository) {
                    metadata.generation = outcome.new_generation;
                    metadata.pending_generation = outcome.new_generation;
                    metadata.pending_order = None;
                }

                match target {
                    FinalizeTarget::Snapshot(uuid) => {
                        if let Some(entry) = self.state.snapshots.remove(&uuid) {
                            tracing::info!(
                                snapshot = %entry.snapshot,
                                repo = %repository,
                                generation = %outcome.new_generation,
                                "snapshot finalized"
                            );
                        }
                        if let Some(info) = outcome.info {
                            for waiter in self.create_waiters.remove(&uuid).unwrap_or_default() {
                                waiter.send(Ok(info.clone())).ok();
                            }
                        }
                    }
                    FinalizeTarget::Deletion(uuid) => {
                        if let Some(entry) = self.state.deletions.remove(&uuid) {
                            tracing::info!(
                                deletion = %entry.uuid,
                                repo = %repository,
                                generation = %outcome.new_generation,
                                "deletion finalized"
                            );
                        }
                        for waiter in self.delete_waiters.remove(&uuid).unwrap_or_default() {
                            waiter.send(Ok(())).ok();
                        }

                        if !outcome.orphaned.is_empty() {
                            if let Some(repo) = self.open_repository(&repository) {
                                let orphaned = outcome.orphaned;
                                self.tasks.spawn(async move {
                                    repo.delete_blobs(&orphaned).await;
                                });
                            }
                        }
                    }
                }

                self.finish(Vec::new());
            }
            Err(error) => {
                let quarantining = is_repository_fatal(&error);
                let replicated = self.on_repository_error(&repository, &error);

                if !quarantining {
                    // Transient failure: fail this operation alone and leave the repository
                    // usable.
                    if let Some(metadata) = self.state.repositories.get_mut(&repository) {
                        metadata.pending_generation = metadata.generation;
                        metadata.pending_order = None;
                    }
                    match target {
                        FinalizeTarget::Snapshot(uuid) => {
                            self.state.snapshots.remove(&uuid);
                            self.fail_create_waiters(&uuid, &replicated);
                        }
                        FinalizeTarget::Deletion(uuid) => {
                            self.state.deletions.remove(&uuid);
                            self.fail_delete_waiters(&uuid, &replicated);
                        }
                    }
                }

                self.finish(Vec::new());
            }
        }
    }

    fn on_probed(&mut self, repository: String, result: Result<RepositoryData>) {
        self.trackers.probing.remove(&repository);

        let Some(metadata) = self.state.repositories.get(&repository) else {
            return;
        };
        let safe = metadata.generation;
        let pending = metadata.pending_generation;
        let pending_order = metadata.pending_order;

        match result {
            Ok(data) if data.generation == pending => {
                // The finalization the previous master dispatched did commit. Adopt its result
                // and retire the entry that was holding the slot, exactly as a finalize
                // completion would.
                tracing::info!(repo = %repository, generation = %pending, "inherited finalization had committed");
                if let Some(metadata) = self.state.repositories.get_mut(&repository) {
                    metadata.generation = pending;
                    metadata.pending_order = None;
                }

                let holder = pending_order
                    .and_then(|order| transitions::target_by_order(&self.state, &repository, order));
                match holder {
                    Some(FinalizeTarget::Snapshot(uuid)) => {
                        if let Some(entry) = self.state.snapshots.remove(&uuid) {
                            let info = SnapshotInfo::completed(&entry, now_millis());
                            for waiter in self.create_waiters.remove(&uuid).unwrap_or_default() {
                                waiter.send(Ok(info.clone())).ok();
                            }
                        }
                    }
                    Some(FinalizeTarget::Deletion(uuid)) => {
                        self.state.deletions.remove(&uuid);
                        for waiter in self.delete_waiters.remove(&uuid).unwrap_or_default() {
                            waiter.send(Ok(())).ok();
                        }
                    }
                    None => (),
                }

                self.finish(Vec::new());
            }
            Ok(data) if data.generation == safe => {
                // The write never happened; the slot is free again.
                if let Some(metadata) = self.state.repositories.get_mut(&repository) {
                    metadata.pending_generation = safe;
                    metadata.pending_order = None;
                }
                self.finish(Vec::new());
            }
            Ok(data) => {
                self.quarantine(
                    &repository,
                    QuarantineReason::Inconsistent {
                        expected: safe,
                        actual: data.generation,
                    },
                );
                self.finish(Vec::new());
            }
            Err(error) => {
                self.on_repository_error(&repository, &error);
                // Transient errors leave pending > safe; the next reconcile probes again.
                self.finish(Vec::new());
            }
        }
    }

    // --- helpers ---------------------------------------------------------------------------

    fn check_repository(&self, name: &str) -> Result<()> {
        match self.state.repositories.get(name) {
            None => Err(Error::RepositoryMissing(name.to_owned())),
            Some(metadata) => match &metadata.quarantine {
                Some(reason) => Err(quarantine_error(name, reason)),
                None => Ok(()),
            },
        }
    }

    fn open_repository(&self, name: &str) -> Option<Repository> {
        let metadata = self.state.repositories.get(name)?;
        let store = self.registry.open(&metadata.kind, &metadata.settings).ok()?;
        Some(Repository::new(name, store))
    }

    /// Spawns a repository data load for an admission path. The loaded data is validated
    /// against the replicated generation when it comes back (see
    /// [`Self::accept_admission_data`]); retries re-enter through the same event constructor.
    fn spawn_admission_load(
        &mut self,
        repository: &str,
        attempt: u32,
        make_event: impl FnOnce(Result<RepositoryData>, u32) -> Event + Send + 'static,
    ) {
        let Some(repo) = self.open_repository(repository) else {
            let event = make_event(
                Err(Error::RepositoryMissing(repository.to_owned())),
                attempt,
            );
            self.events_tx.send(event).ok();
            return;
        };

        let events_tx = self.events_tx.clone();
        self.tasks.spawn(async move {
            if attempt > 0 {
                tokio::time::sleep(ADMIT_RETRY_DELAY).await;
            }
            let data = repo.load_repository_data(None).await;
            events_tx.send(make_event(data, attempt)).ok();
        });
    }

    /// Validates admission-loaded repository data against the replicated generation. A
    /// mismatch while one of our own writes is in flight is a benign race and retried; a
    /// mismatch on an idle repository is external mutation and quarantines it.
    fn accept_admission_data(
        &mut self,
        repository: &str,
        data: Result<RepositoryData>,
        attempt: u32,
    ) -> AdmissionData {
        let data = match data {
            Ok(data) => data,
            Err(error) => {
                let replicated = self.on_repository_error(repository, &error);
                return AdmissionData::Failed(replicated);
            }
        };

        let Some(metadata) = self.state.repositories.get(repository) else {
            return AdmissionData::Failed(Error::RepositoryMissing(repository.to_owned()));
        };
        let safe = metadata.generation;

        if safe.is_sentinel() {
            self.seed_generation(repository, &data);
            return AdmissionData::Ready(data);
        }
        if data.generation == safe {
            return AdmissionData::Ready(data);
        }

        let busy = self.trackers.finalizing.contains(repository)
            || self.trackers.probing.contains(repository);

        if busy && attempt < ADMIT_RETRY_LIMIT {
            return AdmissionData::Retry;
        }
        if data.generation < safe && attempt < ADMIT_RETRY_LIMIT {
            // Most likely a read that raced with our own just-committed write; re-read before
            // concluding anything about the repository.
            return AdmissionData::Retry;
        }

        self.quarantine(
            repository,
            QuarantineReason::Inconsistent {
                expected: safe,
                actual: data.generation,
            },
        );
        AdmissionData::Failed(quarantine_error(
            repository,
            &QuarantineReason::Inconsistent {
                expected: safe,
                actual: data.generation,
            },
        ))
    }

    /// First successful load of a repository seeds the replicated generation counters.
    fn seed_generation(&mut self, repository: &str, data: &RepositoryData) {
        if let Some(metadata) = self.state.repositories.get_mut(repository) {
            if metadata.generation.is_sentinel() && metadata.quarantine.is_none() {
                metadata.generation = data.generation;
                metadata.pending_generation = data.generation;
            }
        }
    }

    /// Quarantines the repository when the error is fatal for it. Returns a replica of the
    /// error for the caller to hand to its own waiter.
    fn on_repository_error(&mut self, repository: &str, error: &Error) -> Error {
        match error {
            Error::RepositoryInconsistent {
                expected, actual, ..
            } => {
                self.quarantine(
                    repository,
                    QuarantineReason::Inconsistent {
                        expected: *expected,
                        actual: *actual,
                    },
                );
            }
            Error::CorruptRepository { generation, .. } => {
                self.quarantine(
                    repository,
                    QuarantineReason::Corrupt {
                        generation: *generation,
                    },
                );
            }
            Error::RepositoryConcurrentModification { from, .. } => {
                self.quarantine(
                    repository,
                    QuarantineReason::Inconsistent {
                        expected: *from,
                        actual: RepositoryGeneration::UNKNOWN,
                    },
                );
            }
            _ => (),
        }

        replicate_error(error)
    }

    /// Marks the repository broken and fails every entry referencing it, queued operations
    /// included. The quarantine holds until an operator re-registers the repository.
    fn quarantine(&mut self, repository: &str, reason: QuarantineReason) {
        tracing::warn!(repo = %repository, ?reason, "repository quarantined");

        if let Some(metadata) = self.state.repositories.get_mut(repository) {
            metadata.quarantine = Some(reason.clone());
            metadata.generation = RepositoryGeneration::CORRUPTED;
            metadata.pending_generation = RepositoryGeneration::CORRUPTED;
            metadata.pending_order = None;
        }

        let snapshots: Vec<SnapshotUuid> = self
            .state
            .snapshots
            .for_repository(repository)
            .map(|entry| entry.snapshot.uuid)
            .collect();
        for uuid in snapshots {
            self.state.snapshots.remove(&uuid);
            let error = quarantine_error(repository, &reason);
            self.fail_create_waiters(&uuid, &error);
        }

        let deletions: Vec<DeletionUuid> = self
            .state
            .deletions
            .for_repository(repository)
            .map(|entry| entry.uuid)
            .collect();
        for uuid in deletions {
            self.state.deletions.remove(&uuid);
            let error = quarantine_error(repository, &reason);
            self.fail_delete_waiters(&uuid, &error);
        }
    }

    fn fail_create_waiters(&mut self, uuid: &SnapshotUuid, error: &Error) {
        for waiter in self.create_waiters.remove(uuid).unwrap_or_default() {
            waiter.send(Err(replicate_error(error))).ok();
        }
    }

    fn fail_delete_waiters(&mut self, uuid: &DeletionUuid, error: &Error) {
        for waiter in self.delete_waiters.remove(uuid).unwrap_or_default() {
            waiter.send(Err(replicate_error(error))).ok();
        }
    }

    fn run_effects(&mut self, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::AbortShard {
                    node,
                    snapshot,
                    shard,
                } => {
                    self.directory.abort_shard_snapshot(&node, &snapshot, &shard);
                }
                SideEffect::LoadForAssign {
                    repository,
                    snapshot,
                } => {
                    if !self.trackers.assigning.insert(snapshot) {
                        continue;
                    }
                    let Some(repo) = self.open_repository(&repository) else {
                        self.trackers.assigning.remove(&snapshot);
                        continue;
                    };
                    let events_tx = self.events_tx.clone();
                    self.tasks.spawn(async move {
                        let data = repo.load_repository_data(None).await;
                        events_tx
                            .send(Event::AssignShards {
                                repository,
                                snapshot,
                                data,
                            })
                            .ok();
                    });
                }
                SideEffect::Finalize {
                    repository,
                    target,
                    from,
                } => self.spawn_finalize(repository, target, from),
                SideEffect::Probe { repository } => {
                    let Some(repo) = self.open_repository(&repository) else {
                        self.trackers.probing.remove(&repository);
                        continue;
                    };
                    let events_tx = self.events_tx.clone();
                    self.tasks.spawn(async move {
                        let result = repo.load_repository_data(None).await;
                        events_tx
                            .send(Event::Probed { repository, result })
                            .ok();
                    });
                }
            }
        }
    }

    fn spawn_finalize(
        &mut self,
        repository: String,
        target: FinalizeTarget,
        from: RepositoryGeneration,
    ) {
        let Some(repo) = self.open_repository(&repository) else {
            self.trackers.finalizing.remove(&repository);
            return;
        };

        let job = match &target {
            FinalizeTarget::Snapshot(uuid) => {
                self.state.snapshots.get(uuid).cloned().map(FinalizeJob::Snapshot)
            }
            FinalizeTarget::Deletion(uuid) => {
                self.state.deletions.get(uuid).cloned().map(FinalizeJob::Deletion)
            }
        };
        let Some(job) = job else {
            self.trackers.finalizing.remove(&repository);
            return;
        };

        let events_tx = self.events_tx.clone();
        self.tasks.spawn(async move {
            let result = match &job {
                FinalizeJob::Snapshot(entry) => finalize_snapshot(&repo, entry, from).await,
                FinalizeJob::Deletion(entry) => finalize_deletion(&repo, entry, from).await,
            };
            events_tx
                .send(Event::FinalizeDone {
                    repository,
                    target,
                    result,
                })
                .ok();
        });
    }
}

enum FinalizeJob {
    Snapshot(SnapshotEntry),
    Deletion(DeletionEntry),
}

enum AdmissionData {
    Ready(RepositoryData),
    Retry,
    Failed(Error),
}

/// Metadata blob body written per index, shared across snapshots.
#[derive(Serialize)]
struct IndexMetadataBlob<'a> {
    name: &'a str,
    uuid: &'a crate::protocol::IndexUuid,
    shards: u32,
}

/// The root metadata write of a completed (or aborted) snapshot entry. Aborted entries
/// finalize too, recording a failed snapshot which the pending deletion then removes; this
/// keeps the generation arithmetic uniform: every entry accounts for exactly one generation.
async fn finalize_snapshot(
    repo: &Repository,
    entry: &SnapshotEntry,
    from: RepositoryGeneration,
) -> Result<FinalizeOutcome> {
    let to = from.next();
    let mut data = repo.load_repository_data(Some(from)).await?;

    if data.contains_name(&entry.snapshot.name) {
        return Err(Error::InvalidSnapshotName {
            name: entry.snapshot.name.clone(),
            reason: "snapshot with the same name already exists".to_owned(),
        });
    }

    let info = SnapshotInfo::completed(entry, now_millis());

    let mut metas = Vec::new();
    for index in &entry.indices {
        let meta_uuid = match data.index_metadata_uuid(&index.uuid) {
            Some(existing) => existing.to_owned(),
            None => {
                let meta_uuid = hex::encode(rand::random::<[u8; 16]>());
                let shards = entry
                    .shards
                    .keys()
                    .filter(|shard| shard.index == *index)
                    .count() as u32;
                let body = serde_json::to_vec(&IndexMetadataBlob {
                    name: &index.name,
                    uuid: &index.uuid,
                    shards,
                })
                .map_err(|error| Error::Io(io::Error::new(io::ErrorKind::InvalidData, error)))?;
                repo.write_index_metadata(&meta_uuid, &body).await?;
                meta_uuid
            }
        };
        metas.push((index.uuid, meta_uuid));
    }

    repo.write_snapshot_details(&info).await?;

    let produced: Vec<(ShardId, ShardGeneration)> = entry
        .shards
        .iter()
        .filter_map(|(shard, status)| match (status.state, status.generation) {
            (ShardState::Success, Some(generation)) => Some((shard.clone(), generation)),
            _ => None,
        })
        .collect();

    data.add_snapshot(
        SnapshotRecord {
            uuid: entry.snapshot.uuid,
            name: entry.snapshot.name.clone(),
            state: info.state,
        },
        metas,
        produced,
    );

    repo.write_repository_data(from, to, &data).await?;

    Ok(FinalizeOutcome {
        new_generation: to,
        info: Some(info),
        orphaned: Vec::new(),
    })
}

/// The root metadata write of a deletion batch: removes every named snapshot in one
/// generation bump and reports the orphaned blobs for garbage collection.
async fn finalize_deletion(
    repo: &Repository,
    entry: &DeletionEntry,
    from: RepositoryGeneration,
) -> Result<FinalizeOutcome> {
    let to = from.next();
    let mut data = repo.load_repository_data(Some(from)).await?;

    let uuids: Vec<SnapshotUuid> = entry.snapshots.iter().map(|id| id.uuid).collect();
    let orphaned = data.remove_snapshots(&uuids);

    repo.write_repository_data(from, to, &data).await?;

    Ok(FinalizeOutcome {
        new_generation: to,
        info: None,
        orphaned,
    })
}

async fn read_snapshots(
    repo: &Repository,
    patterns: &[String],
    mut into: Vec<SnapshotInfo>,
) -> Result<Vec<SnapshotInfo>> {
    let data = repo.load_repository_data(None).await?;

    for pattern in patterns {
        if !deletions::is_wildcard(pattern) && !data.contains_name(pattern) {
            return Err(Error::SnapshotMissing(pattern.clone()));
        }
    }

    let matching: Vec<&SnapshotRecord> = data
        .snapshots
        .iter()
        .filter(|record| {
            patterns
                .iter()
                .any(|pattern| deletions::name_matches(pattern, &record.name))
        })
        .collect();

    let details = future::join_all(
        matching
            .iter()
            .map(|record| repo.read_snapshot_details(&record.uuid)),
    )
    .await;

    for (record, detail) in matching.into_iter().zip(details) {
        match detail {
            Ok(info) => into.push(info),
            // The detail blob may be gone (partially deleted repository); fall back to the
            // record itself.
            Err(_) => into.push(SnapshotInfo {
                snapshot: SnapshotId {
                    name: record.name.clone(),
                    uuid: record.uuid,
                },
                state: record.state,
                indices: Vec::new(),
                start_time_millis: 0,
                end_time_millis: None,
                total_shards: 0,
                failures: Vec::new(),
            }),
        }
    }

    Ok(into)
}

fn is_repository_fatal(error: &Error) -> bool {
    matches!(
        error,
        Error::RepositoryInconsistent { .. }
            | Error::CorruptRepository { .. }
            | Error::RepositoryConcurrentModification { .. }
    )
}

fn quarantine_error(name: &str, reason: &QuarantineReason) -> Error {
    match reason {
        QuarantineReason::Inconsistent { expected, actual } => Error::RepositoryInconsistent {
            name: name.to_owned(),
            expected: *expected,
            actual: *actual,
        },
        QuarantineReason::Corrupt { generation } => Error::CorruptRepository {
            name: name.to_owned(),
            generation: *generation,
        },
    }
}

/// Errors are not `Clone`; requests that fan out to several waiters hand each an equivalent
/// reconstruction.
fn replicate_error(error: &Error) -> Error {
    match error {
        Error::RepositoryMissing(name) => Error::RepositoryMissing(name.clone()),
        Error::RepositoryInUse(name) => Error::RepositoryInUse(name.clone()),
        Error::SnapshotMissing(name) => Error::SnapshotMissing(name.clone()),
        Error::InvalidSnapshotName { name, reason } => Error::InvalidSnapshotName {
            name: name.clone(),
            reason: reason.clone(),
        },
        Error::RepositoryInconsistent {
            name,
            expected,
            actual,
        } => Error::RepositoryInconsistent {
            name: name.clone(),
            expected: *expected,
            actual: *actual,
        },
        Error::CorruptRepository { name, generation } => Error::CorruptRepository {
            name: name.clone(),
            generation: *generation,
        },
        Error::RepositoryConcurrentModification { name, from } => {
            Error::RepositoryConcurrentModification {
                name: name.clone(),
                from: *from,
            }
        }
        Error::MasterLost => Error::MasterLost,
        Error::ShardSnapshotFailed(reason) => Error::ShardSnapshotFailed(reason.clone()),
        Error::SnapshotAborted => Error::SnapshotAborted,
        Error::Store(error) => Error::Io(io::Error::new(io::ErrorKind::Other, error.to_string())),
        Error::Io(error) => Error::Io(io::Error::new(error.kind(), error.to_string())),
    }
}
