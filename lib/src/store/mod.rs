//! Blob store abstraction the repository layer persists into: an opaque key→bytes store with
//! list, best-effort delete and a compare-and-swap keyed on the root `index-N` generation.

mod fs;
mod memory;
mod registry;

pub use self::{fs::FsStore, memory::MemoryStore};
pub(crate) use self::registry::Registry;

use async_trait::async_trait;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error(
        "root index compare-and-swap failed (expected generation {expected:?}, found {actual:?})"
    )]
    CasFailure {
        expected: Option<i64>,
        actual: Option<i64>,
    },
    #[error("blob store I/O failed")]
    Io(#[source] io::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Reads the whole blob. Fails with [`Error::NotFound`] when absent.
    async fn read(&self, path: &str) -> Result<Vec<u8>, Error>;

    /// Writes the blob, durably before returning. Overwrites silently.
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), Error>;

    /// Best-effort batch delete. Missing blobs count as deleted.
    async fn delete(&self, paths: &[String]) -> Result<(), Error>;

    /// Lists blob paths under the prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;

    /// Atomically creates `index-{new_generation}` iff the highest root index currently present
    /// matches `expected` (`None` = no root index at all). This is the only primitive the
    /// generation arbiter ultimately relies on.
    async fn compare_and_swap_root(
        &self,
        expected: Option<i64>,
        new_generation: i64,
        data: &[u8],
    ) -> Result<(), Error>;
}

/// The highest root `index-N` generation present, from a listing.
pub(crate) async fn latest_root_generation(store: &dyn BlobStore) -> Result<Option<i64>, Error> {
    let paths = store.list(paths::ROOT_INDEX_PREFIX).await?;
    Ok(paths
        .iter()
        .filter_map(|path| paths::parse_root_index(path))
        .max())
}

/// Blob naming scheme. The layout is a compatibility contract; changing it orphans existing
/// repositories.
pub(crate) mod paths {
    use crate::protocol::{IndexUuid, ShardGeneration, SnapshotUuid};

    pub const ROOT_INDEX_PREFIX: &str = "index-";
    pub const INDEX_LATEST: &str = "index.latest";

    pub fn root_index(generation: i64) -> String {
        format!("{ROOT_INDEX_PREFIX}{generation}")
    }

    pub fn parse_root_index(path: &str) -> Option<i64> {
        path.strip_prefix(ROOT_INDEX_PREFIX)?.parse().ok()
    }

    pub fn snapshot_details(uuid: &SnapshotUuid) -> String {
        format!("snap-{uuid}.dat")
    }

    pub fn index_metadata(uuid: &str) -> String {
        format!("meta-{uuid}.dat")
    }

    pub fn shard_prefix(index: &IndexUuid, shard: u32) -> String {
        format!("indices/{index}/{shard}/")
    }

    pub fn shard_index(index: &IndexUuid, shard: u32, generation: ShardGeneration) -> String {
        format!("indices/{index}/{shard}/index-{generation}")
    }

    pub fn shard_blob(index: &IndexUuid, shard: u32, name: &str) -> String {
        format!("indices/{index}/{shard}/__{name}")
    }

}
