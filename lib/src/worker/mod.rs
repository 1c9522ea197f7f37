//! The data-node side: uploads a single shard's segments into a repository and reports the
//! outcome back to whoever the current master is. Uploads for different shards run in parallel
//! bounded by a fixed-size pool; the dispatch layer guarantees at most one upload per
//! `(snapshot, shard)` key at a time.

use crate::{
    protocol::{NodeId, ShardGeneration, ShardId, ShardSnapshotStatus, SnapshotUuid},
    repository::Repository,
};
use rand::{distributions::Standard, Rng};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as BlockingMutex},
};
use tokio::sync::{watch, Notify, Semaphore};

/// Number of shard uploads a node runs concurrently (the snapshot thread pool size).
const SNAPSHOT_POOL_SIZE: usize = 5;

/// Number of synthetic segment blobs written per shard upload. Stands in for the segment files
/// a real uploader would read from the shard.
const SEGMENTS_PER_SHARD: usize = 3;

pub(crate) type UploadKey = (SnapshotUuid, ShardId);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Interrupt {
    Abort,
    Pause,
}

/// Per data node shard snapshot worker.
#[derive(Clone)]
pub(crate) struct ShardWorker {
    shared: Arc<Shared>,
}

struct Shared {
    node: NodeId,
    pool: Arc<Semaphore>,
    /// Interrupt senders of in-flight uploads.
    active: BlockingMutex<HashMap<UploadKey, watch::Sender<Option<Interrupt>>>>,
    /// Terminal statuses this node produced, kept for retransmission to a new master.
    completed: BlockingMutex<HashMap<UploadKey, ShardSnapshotStatus>>,
    /// Statuses not yet sent to the master.
    outbox: BlockingMutex<Vec<(UploadKey, ShardSnapshotStatus)>>,
    outbox_notify: Notify,
    /// Per-repository upload gates. Closed gates hold uploads at a safe point; tests use this
    /// to pin an upload mid-flight.
    gates: BlockingMutex<HashMap<String, watch::Sender<bool>>>,
    /// Whether status reports may flow to the master. Tests close this to simulate a
    /// partitioned node whose acknowledgements are delayed.
    reports: watch::Sender<bool>,
}

impl ShardWorker {
    pub fn new(node: NodeId) -> Self {
        Self {
            shared: Arc::new(Shared {
                node,
                pool: Arc::new(Semaphore::new(SNAPSHOT_POOL_SIZE)),
                active: BlockingMutex::new(HashMap::new()),
                completed: BlockingMutex::new(HashMap::new()),
                outbox: BlockingMutex::new(Vec::new()),
                outbox_notify: Notify::new(),
                gates: BlockingMutex::new(HashMap::new()),
                reports: watch::channel(true).0,
            }),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.shared.node
    }

    /// Starts the upload unless one for the same key is already running or already finished.
    pub fn start_shard_snapshot(
        &self,
        repository: Repository,
        snapshot: SnapshotUuid,
        shard: ShardId,
        generation: ShardGeneration,
    ) {
        let key = (snapshot, shard.clone());

        {
            let mut active = self.shared.active.lock().unwrap();
            if active.contains_key(&key) || self.shared.completed.lock().unwrap().contains_key(&key)
            {
                return;
            }

            let (interrupt_tx, interrupt_rx) = watch::channel(None);
            active.insert(key.clone(), interrupt_tx);

            let shared = self.shared.clone();
            tokio::spawn(async move {
                let status = run_upload(&shared, repository, &shard, generation, interrupt_rx).await;

                shared.active.lock().unwrap().remove(&key);
                if status.is_terminal() {
                    shared
                        .completed
                        .lock()
                        .unwrap()
                        .insert(key.clone(), status.clone());
                }
                shared.outbox.lock().unwrap().push((key, status));
                shared.outbox_notify.notify_one();
            });
        }
    }

    /// Interrupts one in-flight upload. The upload completes as aborted at the next safe point.
    /// No-op when the upload already finished, which keeps the master's abort path idempotent.
    pub fn abort_shard_snapshot(&self, snapshot: &SnapshotUuid, shard: &ShardId) {
        let active = self.shared.active.lock().unwrap();
        if let Some(interrupt) = active.get(&(*snapshot, shard.clone())) {
            interrupt.send_replace(Some(Interrupt::Abort));
        }
    }

    /// Pauses every in-flight upload; used when this node gets a shutdown-for-removal marker.
    pub fn pause_all(&self) {
        for interrupt in self.shared.active.lock().unwrap().values() {
            // An abort that raced ahead wins; pausing is weaker.
            interrupt.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(Interrupt::Pause);
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Closes the upload gate of one repository: uploads touching it hold at the next safe
    /// point until [`Self::open_gate`].
    pub fn close_gate(&self, repository: &str) {
        self.gate(repository).send_replace(false);
    }

    pub fn open_gate(&self, repository: &str) {
        self.gate(repository).send_replace(true);
    }

    /// Holds all status reporting to the master until [`Self::release_reports`].
    pub fn hold_reports(&self) {
        self.shared.reports.send_replace(false);
    }

    pub fn release_reports(&self) {
        self.shared.reports.send_replace(true);
    }

    pub fn reports_subscribe(&self) -> watch::Receiver<bool> {
        self.shared.reports.subscribe()
    }

    fn gate(&self, repository: &str) -> watch::Sender<bool> {
        self.shared
            .gates
            .lock()
            .unwrap()
            .entry(repository.to_owned())
            .or_insert_with(|| watch::channel(true).0)
            .clone()
    }

    pub fn is_active(&self, key: &UploadKey) -> bool {
        self.shared.active.lock().unwrap().contains_key(key)
    }

    pub fn completed_status(&self, key: &UploadKey) -> Option<ShardSnapshotStatus> {
        self.shared.completed.lock().unwrap().get(key).cloned()
    }

    /// Drains statuses that have not been reported to a master yet.
    pub fn drain_outbox(&self) -> Vec<(UploadKey, ShardSnapshotStatus)> {
        std::mem::take(&mut *self.shared.outbox.lock().unwrap())
    }

    pub async fn outbox_ready(&self) {
        self.shared.outbox_notify.notified().await
    }

    /// Every terminal status this node knows. Retransmitted wholesale when the master changes;
    /// the receiving side ignores updates for entries that are gone or already terminal.
    pub fn terminal_statuses(&self) -> Vec<(UploadKey, ShardSnapshotStatus)> {
        self.shared
            .completed
            .lock()
            .unwrap()
            .iter()
            .map(|(key, status)| (key.clone(), status.clone()))
            .collect()
    }

    /// Drops terminal statuses for snapshots that are no longer in progress anywhere.
    pub fn prune_completed(&self, still_relevant: impl Fn(&SnapshotUuid) -> bool) {
        self.shared
            .completed
            .lock()
            .unwrap()
            .retain(|(snapshot, _), _| still_relevant(snapshot));
    }
}

async fn run_upload(
    shared: &Shared,
    repository: Repository,
    shard: &ShardId,
    issued: ShardGeneration,
    mut interrupt_rx: watch::Receiver<Option<Interrupt>>,
) -> ShardSnapshotStatus {
    let _permit = match shared.pool.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return interrupted_status(shared, Interrupt::Abort, issued),
    };

    let mut gate_rx = shared
        .gates
        .lock()
        .unwrap()
        .entry(repository.name().to_owned())
        .or_insert_with(|| watch::channel(true).0)
        .subscribe();

    let produced = issued.next();
    let mut names = Vec::with_capacity(SEGMENTS_PER_SHARD);

    for _ in 0..SEGMENTS_PER_SHARD {
        // Hold at the gate, but stay responsive to aborts while held.
        tokio::select! {
            _ = gate_rx.wait_for(|open| *open) => (),
            _ = interrupt_rx.wait_for(|interrupt| interrupt.is_some()) => (),
        }

        if let Some(interrupt) = *interrupt_rx.borrow() {
            tracing::debug!(node = %shared.node, %shard, ?interrupt, "shard upload interrupted");
            return interrupted_status(shared, interrupt, issued);
        }

        let name: String = hex::encode(
            rand::thread_rng()
                .sample_iter::<u8, _>(Standard)
                .take(8)
                .collect::<Vec<_>>(),
        );
        let bytes = synthetic_segment(shard);

        if let Err(error) = repository
            .write_shard_blob(&shard.index, shard.shard, &name, &bytes)
            .await
        {
            tracing::warn!(node = %shared.node, %shard, ?error, "shard upload failed");
            return ShardSnapshotStatus::failed(Some(shared.node.clone()), error.to_string());
        }

        names.push(name);
    }

    if let Err(error) = repository
        .write_shard_manifest(&shard.index, shard.shard, produced, names)
        .await
    {
        tracing::warn!(node = %shared.node, %shard, ?error, "shard manifest write failed");
        return ShardSnapshotStatus::failed(Some(shared.node.clone()), error.to_string());
    }

    tracing::debug!(node = %shared.node, %shard, generation = %produced, "shard upload finished");
    ShardSnapshotStatus::success(shared.node.clone(), produced)
}

fn interrupted_status(
    shared: &Shared,
    interrupt: Interrupt,
    issued: ShardGeneration,
) -> ShardSnapshotStatus {
    match interrupt {
        Interrupt::Abort => {
            ShardSnapshotStatus::failed(Some(shared.node.clone()), "aborted by deletion")
        }
        Interrupt::Pause => ShardSnapshotStatus {
            state: crate::protocol::ShardState::PausedForNodeRemoval,
            node: Some(shared.node.clone()),
            generation: Some(issued),
            failure: None,
        },
    }
}

fn synthetic_segment(shard: &ShardId) -> Vec<u8> {
    // Stand-in for reading actual segment files from the shard.
    format!("segment data of {shard}").into_bytes()
}

/// Routing of master-side abort calls to the right node's worker.
#[derive(Clone, Default)]
pub(crate) struct NodeDirectory {
    workers: Arc<BlockingMutex<HashMap<NodeId, ShardWorker>>>,
}

impl NodeDirectory {
    pub fn register(&self, worker: ShardWorker) {
        self.workers
            .lock()
            .unwrap()
            .insert(worker.node().clone(), worker);
    }

    pub fn get(&self, node: &NodeId) -> Option<ShardWorker> {
        self.workers.lock().unwrap().get(node).cloned()
    }

    pub fn abort_shard_snapshot(&self, node: &NodeId, snapshot: &SnapshotUuid, shard: &ShardId) {
        if let Some(worker) = self.get(node) {
            worker.abort_shard_snapshot(snapshot, shard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{IndexId, ShardState},
        store::{BlobStore, MemoryStore},
    };
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn setup() -> (ShardWorker, Repository, MemoryStore, ShardId) {
        let store = MemoryStore::new();
        let repository = Repository::new("repo", Arc::new(store.clone()));
        let worker = ShardWorker::new(NodeId::from("node-0"));
        let shard = ShardId::new(IndexId::new("idx"), 0);
        (worker, repository, store, shard)
    }

    async fn next_status(worker: &ShardWorker) -> ShardSnapshotStatus {
        loop {
            if let Some((_, status)) = worker.drain_outbox().pop() {
                return status;
            }
            worker.outbox_ready().await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_writes_blobs_and_reports_success() {
        let (worker, repository, store, shard) = setup();

        worker.start_shard_snapshot(
            repository,
            SnapshotUuid::random(),
            shard.clone(),
            ShardGeneration(0),
        );

        let status = next_status(&worker).await;
        assert_eq!(status.state, ShardState::Success);
        assert_eq!(status.generation, Some(ShardGeneration(1)));

        let blobs = store
            .list(&format!("indices/{}/0/", shard.index.uuid))
            .await
            .unwrap();
        // Three segment blobs plus the manifest.
        assert_eq!(blobs.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gated_upload_aborts_while_held() {
        let (worker, repository, _, shard) = setup();
        let snapshot = SnapshotUuid::random();

        worker.close_gate("repo");
        worker.start_shard_snapshot(
            repository,
            snapshot,
            shard.clone(),
            ShardGeneration(0),
        );

        // Give the upload a moment to reach the gate, then abort it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.abort_shard_snapshot(&snapshot, &shard);

        let status = next_status(&worker).await;
        assert_eq!(status.state, ShardState::Failed);
        assert_matches!(status.failure.as_deref(), Some("aborted by deletion"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_start_is_ignored() {
        let (worker, repository, _, shard) = setup();
        let snapshot = SnapshotUuid::random();

        worker.start_shard_snapshot(
            repository.clone(),
            snapshot,
            shard.clone(),
            ShardGeneration(0),
        );
        worker.start_shard_snapshot(repository, snapshot, shard, ShardGeneration(0));

        let _ = next_status(&worker).await;
        // Only one upload ran; the outbox stays empty afterwards.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.drain_outbox().is_empty());
    }
}
