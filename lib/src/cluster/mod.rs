//! A minimal in-process cluster: nodes share a published cluster-state channel, the elected
//! master runs the coordinator, data nodes react to published entries by running shard uploads
//! and reporting outcomes to whoever the current master is. The membership layer of a real
//! deployment is an external collaborator; this is the smallest local implementation that
//! exercises the coordination core, failover included.

mod client;


pub use self::client::Client;
pub use crate::coordinator::CreateOptions;

use crate::{
    coordinator::{Coordinator, CoordinatorHandle, Event},
    protocol::{ClusterState, NodeId, ShardState},
    repository::Repository,
    store::{MemoryStore, Registry},
    worker::{NodeDirectory, ShardWorker},
};
use std::sync::{Arc, Mutex as BlockingMutex};
use tokio::{sync::watch, task::JoinHandle};

pub struct ClusterBuilder {
    nodes: Vec<NodeSpec>,
}

struct NodeSpec {
    id: NodeId,
    master_eligible: bool,
    data: bool,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// A master-eligible node that holds no shard data.
    pub fn add_master_node(mut self, name: &str) -> Self {
        self.nodes.push(NodeSpec {
            id: NodeId::from(name),
            master_eligible: true,
            data: false,
        });
        self
    }

    /// A data-only node.
    pub fn add_data_node(mut self, name: &str) -> Self {
        self.nodes.push(NodeSpec {
            id: NodeId::from(name),
            master_eligible: false,
            data: true,
        });
        self
    }

    /// A node carrying both roles.
    pub fn add_node(mut self, name: &str) -> Self {
        self.nodes.push(NodeSpec {
            id: NodeId::from(name),
            master_eligible: true,
            data: true,
        });
        self
    }

    /// Starts the cluster: data-node tasks plus a coordinator on the first master-eligible
    /// node. Must run inside a tokio runtime.
    pub fn build(self) -> Cluster {
        let (state_tx, _) = watch::channel(ClusterState::default());
        let (master_tx, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            state_tx,
            master_tx,
            registry: Arc::new(Registry::new()),
            directory: NodeDirectory::default(),
            inner: BlockingMutex::new(Inner {
                master_eligible: self
                    .nodes
                    .iter()
                    .filter(|spec| spec.master_eligible)
                    .map(|spec| spec.id.clone())
                    .collect(),
                current: None,
                data_tasks: Vec::new(),
            }),
        });

        for spec in &self.nodes {
            if spec.data {
                let worker = ShardWorker::new(spec.id.clone());
                shared.directory.register(worker.clone());
                let task = tokio::spawn(run_data_node(shared.clone(), worker));
                shared.inner.lock().unwrap().data_tasks.push(task);
            }
        }

        let cluster = Cluster { shared };
        let first = {
            let inner = cluster.shared.inner.lock().unwrap();
            inner.master_eligible.first().cloned()
        };
        if let Some(first) = first {
            cluster.start_master(first);
        }
        cluster
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    /// Master-eligible nodes that have not been stopped.
    master_eligible: Vec<NodeId>,
    current: Option<(NodeId, Coordinator)>,
    data_tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct Shared {
    pub state_tx: watch::Sender<ClusterState>,
    pub master_tx: watch::Sender<Option<CoordinatorHandle>>,
    pub registry: Arc<Registry>,
    directory: NodeDirectory,
    inner: BlockingMutex<Inner>,
}

pub struct Cluster {
    shared: Arc<Shared>,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    pub fn client(&self) -> Client {
        Client::new(self.shared.clone())
    }

    pub fn current_master(&self) -> Option<NodeId> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(|(id, _)| id.clone())
    }

    /// The latest published cluster state.
    pub fn state(&self) -> ClusterState {
        self.shared.state_tx.borrow().clone()
    }

    /// Waits until a published state satisfies the predicate.
    pub async fn wait_for_state(&self, mut predicate: impl FnMut(&ClusterState) -> bool) {
        let mut rx = self.shared.state_tx.subscribe();
        // The sender lives in self, so this cannot fail.
        rx.wait_for(|state| predicate(state)).await.ok();
    }

    /// Stops the current master: its coordinator is torn down (cancelling outstanding side
    /// effects and failing its request waiters with a retriable error) and the next
    /// master-eligible node takes over from the last published state. Returns the new master.
    pub async fn stop_master(&self) -> Option<NodeId> {
        let (old_id, coordinator, next) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let (old_id, coordinator) = inner.current.take()?;
            inner.master_eligible.retain(|id| *id != old_id);
            let next = inner.master_eligible.first().cloned();
            (old_id, coordinator, next)
        };

        self.shared.master_tx.send_replace(None);
        // Wait for the old update loop to actually stop so it cannot publish over the new
        // master's states.
        coordinator.shutdown().await;

        tracing::info!(node = %old_id, "master stopped");

        let next_id = next?;
        self.start_master(next_id.clone());

        if let Some(handle) = self.shared.master_tx.borrow().clone() {
            handle.send(Event::NodeLeft {
                node: old_id.clone(),
            });
        }

        Some(next_id)
    }

    fn start_master(&self, node: NodeId) {
        let coordinator = Coordinator::spawn(
            node.clone(),
            self.shared.state_tx.borrow().clone(),
            self.shared.state_tx.clone(),
            self.shared.registry.clone(),
            self.shared.directory.clone(),
        );
        self.shared
            .master_tx
            .send_replace(Some(coordinator.handle().clone()));
        self.shared.inner.lock().unwrap().current = Some((node, coordinator));
    }

    /// Holds every upload of the repository on the node at its next safe point. Test lever
    /// for pinning snapshots mid-flight.
    pub(crate) fn block_repository_on_node(&self, node: &NodeId, repository: &str) {
        if let Some(worker) = self.shared.directory.get(node) {
            worker.close_gate(repository);
        }
    }

    pub(crate) fn unblock_repository_on_node(&self, node: &NodeId, repository: &str) {
        if let Some(worker) = self.shared.directory.get(node) {
            worker.open_gate(repository);
        }
    }

    /// Holds the node's shard status reports, simulating delayed acknowledgements to the
    /// master.
    pub(crate) fn hold_shard_reports(&self, node: &NodeId) {
        if let Some(worker) = self.shared.directory.get(node) {
            worker.hold_reports();
        }
    }

    pub(crate) fn release_shard_reports(&self, node: &NodeId) {
        if let Some(worker) = self.shared.directory.get(node) {
            worker.release_reports();
        }
    }

    /// The in-memory store behind a `memory` repository location, for out-of-band mutation in
    /// tests.
    pub(crate) fn memory_store(&self, location: &str) -> Option<MemoryStore> {
        self.shared.registry.memory_store(location)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().unwrap();
        for task in inner.data_tasks.drain(..) {
            task.abort();
        }
        inner.current = None;
    }
}

/// The per-data-node reaction loop: observes published states, starts and aborts uploads,
/// reports outcomes to the current master and retransmits known outcomes when the master
/// changes.
async fn run_data_node(shared: Arc<Shared>, worker: ShardWorker) {
    let node = worker.node().clone();
    let mut state_rx = shared.state_tx.subscribe();
    let mut master_rx = shared.master_tx.subscribe();
    let mut reports_rx = worker.reports_subscribe();
    let mut last_master: Option<NodeId> = None;

    loop {
        let state = state_rx.borrow_and_update().clone();
        let master = master_rx.borrow_and_update().clone();
        let reporting = *reports_rx.borrow_and_update();

        if let Some(handle) = &master {
            let master_changed = reporting && last_master.as_ref() != Some(handle.node());
            if master_changed {
                last_master = Some(handle.node().clone());
                tracing::debug!(%node, master = %handle.node(), "re-acknowledging shard outcomes to new master");
                for ((snapshot, shard), status) in worker.terminal_statuses() {
                    if state.snapshots.get(&snapshot).is_some() {
                        handle.send(Event::ShardUpdate {
                            snapshot,
                            shard,
                            status,
                        });
                    }
                }
            }

            let pausing = state.shutdowns.pauses_shard_snapshots(&node);
            if pausing {
                worker.pause_all();
            }

            for entry in state.snapshots.iter() {
                let Some(metadata) = state.repositories.get(&entry.repository) else {
                    continue;
                };

                for (shard, status) in &entry.shards {
                    if status.node.as_ref() != Some(&node) {
                        continue;
                    }
                    let key = (entry.snapshot.uuid, shard.clone());

                    match status.state {
                        ShardState::Init => {
                            if let Some(known) = worker.completed_status(&key) {
                                // The master missed the earlier report; repeat it.
                                if reporting {
                                    handle.send(Event::ShardUpdate {
                                        snapshot: key.0,
                                        shard: key.1,
                                        status: known,
                                    });
                                }
                            } else if pausing {
                                if reporting && !worker.is_active(&key) {
                                    handle.send(Event::ShardUpdate {
                                        snapshot: key.0,
                                        shard: key.1,
                                        status: status.clone().paused(),
                                    });
                                }
                            } else {
                                let Ok(store) = shared
                                    .registry
                                    .open(&metadata.kind, &metadata.settings)
                                else {
                                    continue;
                                };
                                let repository =
                                    Repository::new(entry.repository.clone(), store);
                                worker.start_shard_snapshot(
                                    repository,
                                    key.0,
                                    key.1,
                                    status.generation.unwrap_or_default(),
                                );
                            }
                        }
                        ShardState::Aborted => {
                            if worker.is_active(&key) {
                                worker.abort_shard_snapshot(&key.0, &key.1);
                            } else if !reporting {
                                // The acknowledgement has to wait for the report gate.
                            } else if let Some(known) = worker.completed_status(&key) {
                                handle.send(Event::ShardUpdate {
                                    snapshot: key.0,
                                    shard: key.1,
                                    status: known,
                                });
                            } else {
                                // Nothing ever ran here; acknowledge the abort directly.
                                handle.send(Event::ShardUpdate {
                                    snapshot: key.0,
                                    shard: key.1,
                                    status: crate::protocol::ShardSnapshotStatus::failed(
                                        Some(node.clone()),
                                        "aborted by deletion",
                                    ),
                                });
                            }
                        }
                        _ => (),
                    }
                }
            }

            worker.prune_completed(|uuid| state.snapshots.get(uuid).is_some());

            if reporting {
                for ((snapshot, shard), status) in worker.drain_outbox() {
                    handle.send(Event::ShardUpdate {
                        snapshot,
                        shard,
                        status,
                    });
                }
            }
        }

        tokio::select! {
            result = state_rx.changed() => {
                if result.is_err() {
                    break;
                }
            }
            result = master_rx.changed() => {
                if result.is_err() {
                    break;
                }
            }
            result = reports_rx.changed() => {
                if result.is_err() {
                    break;
                }
            }
            _ = worker.outbox_ready() => (),
        }
    }
}
