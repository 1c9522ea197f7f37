//! Persistence of repository root metadata, atomic with respect to concurrent writers that
//! believe they hold the generation lease.

mod data;

pub use self::data::{RepositoryData, SnapshotRecord};

use crate::{
    error::{Error, Result},
    protocol::{IndexId, RepositoryGeneration, ShardGeneration, SnapshotInfo, SnapshotUuid},
    store::{self, paths, BlobStore},
};
use std::sync::Arc;

/// Handle to one repository's blob store contents.
#[derive(Clone)]
pub struct Repository {
    name: String,
    store: Arc<dyn BlobStore>,
}

impl Repository {
    pub fn new(name: impl Into<String>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads and parses the latest root metadata blob.
    ///
    /// With `expected` supplied, fails with [`Error::RepositoryInconsistent`] when the blob
    /// store's latest generation is not the expected one - the signal that something mutated
    /// the repository out-of-band. Without it, the store's contents are adopted as the truth.
    pub async fn load_repository_data(
        &self,
        expected: Option<RepositoryGeneration>,
    ) -> Result<RepositoryData> {
        let actual = match store::latest_root_generation(&*self.store).await? {
            Some(generation) => RepositoryGeneration(generation),
            None => self.generation_from_latest_pointer().await?,
        };

        if let Some(expected) = expected {
            if expected != actual {
                return Err(Error::RepositoryInconsistent {
                    name: self.name.clone(),
                    expected,
                    actual,
                });
            }
        }

        if actual == RepositoryGeneration::EMPTY {
            return Ok(RepositoryData::empty());
        }

        let bytes = self.store.read(&paths::root_index(actual.0)).await?;
        let mut data: RepositoryData =
            serde_json::from_slice(&bytes).map_err(|error| {
                tracing::warn!(
                    repo = %self.name,
                    generation = %actual,
                    ?error,
                    "root metadata unreadable"
                );
                Error::CorruptRepository {
                    name: self.name.clone(),
                    generation: actual,
                }
            })?;
        data.generation = actual;

        Ok(data)
    }

    /// Writes the next root metadata blob. Atomic: either `index-{to}` becomes the latest
    /// generation or no change is visible.
    pub async fn write_repository_data(
        &self,
        from: RepositoryGeneration,
        to: RepositoryGeneration,
        data: &RepositoryData,
    ) -> Result<()> {
        debug_assert_eq!(to, from.next());

        // Re-verify before writing. A renamed or replaced root blob must fail the operation
        // with a distinct error, not be silently overwritten.
        let actual = match store::latest_root_generation(&*self.store).await? {
            Some(generation) => RepositoryGeneration(generation),
            None => RepositoryGeneration::EMPTY,
        };
        if actual != from {
            return Err(Error::RepositoryInconsistent {
                name: self.name.clone(),
                expected: from,
                actual,
            });
        }

        let bytes = serde_json::to_vec(data).map_err(io_error)?;
        let expected = (from != RepositoryGeneration::EMPTY).then_some(from.0);

        match self
            .store
            .compare_and_swap_root(expected, to.0, &bytes)
            .await
        {
            Ok(()) => (),
            Err(store::Error::CasFailure { .. }) => {
                return Err(Error::RepositoryConcurrentModification {
                    name: self.name.clone(),
                    from,
                })
            }
            Err(error) => return Err(error.into()),
        }

        self.store
            .write(paths::INDEX_LATEST, to.0.to_string().as_bytes())
            .await?;

        tracing::debug!(repo = %self.name, generation = %to, "root metadata written");

        Ok(())
    }

    pub async fn write_snapshot_details(&self, info: &SnapshotInfo) -> Result<()> {
        let bytes = serde_json::to_vec(info).map_err(io_error)?;
        self.store
            .write(&paths::snapshot_details(&info.snapshot.uuid), &bytes)
            .await?;
        Ok(())
    }

    pub async fn read_snapshot_details(&self, uuid: &SnapshotUuid) -> Result<SnapshotInfo> {
        let bytes = self.store.read(&paths::snapshot_details(uuid)).await?;
        serde_json::from_slice(&bytes).map_err(|_| Error::CorruptRepository {
            name: self.name.clone(),
            generation: RepositoryGeneration::UNKNOWN,
        })
    }

    pub async fn write_index_metadata(&self, meta_uuid: &str, bytes: &[u8]) -> Result<()> {
        self.store
            .write(&paths::index_metadata(meta_uuid), bytes)
            .await?;
        Ok(())
    }

    /// Writes one shard data blob. Durable before returning.
    pub async fn write_shard_blob(
        &self,
        index: &IndexId,
        shard: u32,
        name: &str,
        bytes: &[u8],
    ) -> Result<()> {
        self.store
            .write(&paths::shard_blob(&index.uuid, shard, name), bytes)
            .await?;
        Ok(())
    }

    /// Writes the shard metadata blob naming the data blobs of one shard snapshot. Written
    /// last: a manifest only ever references blobs that are already durable.
    pub async fn write_shard_manifest(
        &self,
        index: &IndexId,
        shard: u32,
        generation: ShardGeneration,
        files: Vec<String>,
    ) -> Result<()> {
        let manifest = ShardManifest { generation, files };
        let bytes = serde_json::to_vec(&manifest).map_err(io_error)?;
        self.store
            .write(&paths::shard_index(&index.uuid, shard, generation), &bytes)
            .await?;
        Ok(())
    }

    /// Best-effort blob removal; failures are logged, not propagated.
    pub async fn delete_blobs(&self, blobs: &[String]) {
        if blobs.is_empty() {
            return;
        }

        match self.store.delete(blobs).await {
            Ok(()) => {
                tracing::debug!(repo = %self.name, count = blobs.len(), "deleted stale blobs")
            }
            Err(error) => {
                tracing::warn!(repo = %self.name, ?error, "failed to delete stale blobs")
            }
        }
    }

    async fn generation_from_latest_pointer(&self) -> Result<RepositoryGeneration> {
        // Listing found no root index. `index.latest` is the fallback for stores with
        // unreliable listings; absent both, the repository is genuinely empty.
        match self.store.read(paths::INDEX_LATEST).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let generation: i64 = text.trim().parse().map_err(|_| Error::CorruptRepository {
                    name: self.name.clone(),
                    generation: RepositoryGeneration::UNKNOWN,
                })?;
                Ok(RepositoryGeneration(generation))
            }
            Err(store::Error::NotFound(_)) => Ok(RepositoryGeneration::EMPTY),
            Err(error) => Err(error.into()),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ShardManifest {
    generation: ShardGeneration,
    files: Vec<String>,
}

fn io_error(error: serde_json::Error) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{SnapshotId, SnapshotState},
        store::MemoryStore,
    };
    use assert_matches::assert_matches;

    fn repo() -> (Repository, MemoryStore) {
        let store = MemoryStore::new();
        (Repository::new("repo", Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn empty_repository_loads_as_empty() {
        let (repo, _) = repo();
        let data = repo.load_repository_data(None).await.unwrap();
        assert_eq!(data.generation, RepositoryGeneration::EMPTY);
        assert!(data.snapshots.is_empty());
    }

    #[tokio::test]
    async fn first_write_produces_generation_zero() {
        let (repo, store) = repo();

        let mut data = RepositoryData::empty();
        data.snapshots.push(SnapshotRecord {
            uuid: crate::protocol::SnapshotUuid::random(),
            name: "snap".to_owned(),
            state: SnapshotState::Success,
        });

        repo.write_repository_data(
            RepositoryGeneration::EMPTY,
            RepositoryGeneration(0),
            &data,
        )
        .await
        .unwrap();

        assert!(store.contains("index-0"));
        assert_eq!(store.read("index.latest").await.unwrap(), b"0");

        let loaded = repo.load_repository_data(None).await.unwrap();
        assert_eq!(loaded.generation, RepositoryGeneration(0));
        assert!(loaded.contains_name("snap"));
    }

    #[tokio::test]
    async fn load_detects_unexpected_generation() {
        let (repo, store) = repo();
        repo.write_repository_data(
            RepositoryGeneration::EMPTY,
            RepositoryGeneration(0),
            &RepositoryData::empty(),
        )
        .await
        .unwrap();

        // Out-of-band rename to a higher generation.
        assert!(store.rename_raw("index-0", "index-1"));

        assert_matches!(
            repo.load_repository_data(Some(RepositoryGeneration(0))).await,
            Err(Error::RepositoryInconsistent {
                expected: RepositoryGeneration(0),
                actual: RepositoryGeneration(1),
                ..
            })
        );

        // Without an expectation the store contents are adopted.
        let adopted = repo.load_repository_data(None).await.unwrap();
        assert_eq!(adopted.generation, RepositoryGeneration(1));
    }

    #[tokio::test]
    async fn load_detects_corrupt_root_blob() {
        let (repo, store) = repo();
        repo.write_repository_data(
            RepositoryGeneration::EMPTY,
            RepositoryGeneration(0),
            &RepositoryData::empty(),
        )
        .await
        .unwrap();

        store.put_raw("index-0", b"\xde\xad\xbe\xef".to_vec());

        assert_matches!(
            repo.load_repository_data(None).await,
            Err(Error::CorruptRepository {
                generation: RepositoryGeneration(0),
                ..
            })
        );
    }

    #[tokio::test]
    async fn write_refuses_after_out_of_band_advance() {
        let (repo, store) = repo();
        repo.write_repository_data(
            RepositoryGeneration::EMPTY,
            RepositoryGeneration(0),
            &RepositoryData::empty(),
        )
        .await
        .unwrap();

        assert!(store.rename_raw("index-0", "index-1"));

        assert_matches!(
            repo.write_repository_data(
                RepositoryGeneration(0),
                RepositoryGeneration(1),
                &RepositoryData::empty(),
            )
            .await,
            Err(Error::RepositoryInconsistent { .. })
        );
    }

    #[tokio::test]
    async fn snapshot_details_roundtrip() {
        let (repo, _) = repo();

        let info = SnapshotInfo {
            snapshot: SnapshotId::new("snap"),
            state: SnapshotState::Success,
            indices: Vec::new(),
            start_time_millis: 1,
            end_time_millis: Some(2),
            total_shards: 3,
            failures: Vec::new(),
        };

        repo.write_snapshot_details(&info).await.unwrap();
        let read = repo.read_snapshot_details(&info.snapshot.uuid).await.unwrap();
        assert_eq!(read.snapshot, info.snapshot);
        assert_eq!(read.state, SnapshotState::Success);
    }
}
