use super::Shared;
use crate::{
    coordinator::{CoordinatorHandle, CreateOptions, Event, ReplyTx},
    error::{Error, Result},
    protocol::{
        IndexId, IndexRouting, NodeId, NodeShutdownKind, RepositorySettings, SnapshotInfo,
    },
};
use std::{sync::Arc, time::Duration};

/// How many times idempotent requests chase a new master before giving up, and how long to
/// back off between attempts.
const RETRY_LIMIT: u32 = 20;
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// The admission layer: resolves the current master and forwards requests to it. Idempotent
/// requests (deletes, reads) transparently retry against a new master; creates surface
/// [`Error::MasterLost`] to the caller, because replaying one would mint a second snapshot
/// uuid under the same name.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub async fn create_snapshot(
        &self,
        repository: &str,
        name: &str,
        options: CreateOptions,
    ) -> Result<SnapshotInfo> {
        let repository = repository.to_owned();
        let name = name.to_owned();
        self.request(move |reply| Event::CreateSnapshot {
            repository,
            name,
            options,
            reply,
        })
        .await
    }

    pub async fn delete_snapshots(&self, repository: &str, patterns: &[&str]) -> Result<()> {
        let patterns: Vec<String> = patterns.iter().map(|s| (*s).to_owned()).collect();
        let mut attempt = 0;

        loop {
            let repository = repository.to_owned();
            let patterns = patterns.clone();
            let result = self
                .request(move |reply| Event::DeleteSnapshots {
                    repository,
                    patterns,
                    reply,
                })
                .await;

            match result {
                Err(Error::MasterLost) if attempt < RETRY_LIMIT => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                // An earlier attempt was already applied before the master went away.
                Err(Error::SnapshotMissing(_)) if attempt > 0 => return Ok(()),
                other => return other,
            }
        }
    }

    /// Patterns match completed snapshots; the special pattern `_current` selects in-progress
    /// ones.
    pub async fn get_snapshots(
        &self,
        repository: &str,
        patterns: &[&str],
    ) -> Result<Vec<SnapshotInfo>> {
        let patterns: Vec<String> = patterns.iter().map(|s| (*s).to_owned()).collect();
        let mut attempt = 0;

        loop {
            let repository = repository.to_owned();
            let patterns = patterns.clone();
            let result = self
                .request(move |reply| Event::GetSnapshots {
                    repository,
                    patterns,
                    reply,
                })
                .await;

            match result {
                Err(Error::MasterLost) if attempt < RETRY_LIMIT => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    pub async fn put_repository(
        &self,
        name: &str,
        kind: &str,
        settings: RepositorySettings,
    ) -> Result<()> {
        let name = name.to_owned();
        let kind = kind.to_owned();
        self.request(move |reply| Event::PutRepository {
            name,
            kind,
            settings,
            reply,
        })
        .await
    }

    pub async fn delete_repository(&self, name: &str) -> Result<()> {
        let name = name.to_owned();
        self.request(move |reply| Event::DeleteRepository { name, reply })
            .await
    }

    /// Registers an index with explicit primary assignments and waits for the routing to be
    /// published. The id is minted here the way index creation would.
    pub async fn put_index(&self, name: &str, primaries: Vec<Option<NodeId>>) -> Result<IndexId> {
        let id = IndexId::new(name);
        let routing = IndexRouting::new(id.clone(), primaries);

        let handle = self.master().await?;
        if !handle.send(Event::PutIndex { routing }) {
            return Err(Error::MasterLost);
        }

        let mut rx = self.shared.state_tx.subscribe();
        rx.wait_for(|state| {
            state
                .routing
                .index(&id.name)
                .map(|routing| routing.id.uuid == id.uuid)
                .unwrap_or(false)
        })
        .await
        .map_err(|_| Error::MasterLost)?;

        Ok(id)
    }

    /// Drops an index's routing. Shards of in-flight snapshots that were still waiting for a
    /// primary go missing.
    pub async fn remove_index(&self, name: &str) -> Result<()> {
        let handle = self.master().await?;
        if !handle.send(Event::RemoveIndex {
            name: name.to_owned(),
        }) {
            return Err(Error::MasterLost);
        }

        let name = name.to_owned();
        let mut rx = self.shared.state_tx.subscribe();
        rx.wait_for(|state| state.routing.index(&name).is_none())
            .await
            .map_err(|_| Error::MasterLost)?;
        Ok(())
    }

    pub async fn set_shutdown(
        &self,
        node: &NodeId,
        kind: NodeShutdownKind,
        reason: &str,
    ) -> Result<()> {
        let handle = self.master().await?;
        if !handle.send(Event::SetShutdown {
            node: node.clone(),
            kind,
            reason: reason.to_owned(),
        }) {
            return Err(Error::MasterLost);
        }

        let node = node.clone();
        let mut rx = self.shared.state_tx.subscribe();
        rx.wait_for(|state| state.shutdowns.get(&node).is_some())
            .await
            .map_err(|_| Error::MasterLost)?;
        Ok(())
    }

    pub async fn clear_shutdown(&self, node: &NodeId) -> Result<()> {
        let handle = self.master().await?;
        if !handle.send(Event::ClearShutdown { node: node.clone() }) {
            return Err(Error::MasterLost);
        }

        let node = node.clone();
        let mut rx = self.shared.state_tx.subscribe();
        rx.wait_for(|state| state.shutdowns.get(&node).is_none())
            .await
            .map_err(|_| Error::MasterLost)?;
        Ok(())
    }

    async fn master(&self) -> Result<CoordinatorHandle> {
        let mut rx = self.shared.master_tx.subscribe();
        let handle = rx
            .wait_for(|handle| handle.is_some())
            .await
            .map_err(|_| Error::MasterLost)?;
        handle.clone().ok_or(Error::MasterLost)
    }

    async fn request<T>(&self, make_event: impl FnOnce(ReplyTx<T>) -> Event) -> Result<T> {
        let handle = self.master().await?;
        let (reply, rx) = tokio::sync::oneshot::channel();

        if !handle.send(make_event(reply)) {
            return Err(Error::MasterLost);
        }

        rx.await.map_err(|_| Error::MasterLost)?
    }
}
