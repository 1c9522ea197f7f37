use crate::{protocol::RepositoryGeneration, store};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("repository \"{0}\" is missing")]
    RepositoryMissing(String),
    #[error("repository \"{0}\" is referenced by in-progress snapshot or deletion entries")]
    RepositoryInUse(String),
    #[error("snapshot \"{0}\" is missing")]
    SnapshotMissing(String),
    #[error("invalid snapshot name \"{name}\": {reason}")]
    InvalidSnapshotName { name: String, reason: String },
    #[error(
        "repository \"{name}\" contents do not match the expected state \
         (expected generation {expected}, found {actual})"
    )]
    RepositoryInconsistent {
        name: String,
        expected: RepositoryGeneration,
        actual: RepositoryGeneration,
    },
    #[error("repository \"{name}\" root metadata at generation {generation} is unreadable")]
    CorruptRepository {
        name: String,
        generation: RepositoryGeneration,
    },
    #[error(
        "concurrent modification of repository \"{name}\": \
         generation advanced past {from} by another writer"
    )]
    RepositoryConcurrentModification {
        name: String,
        from: RepositoryGeneration,
    },
    #[error("master node changed or shut down")]
    MasterLost,
    #[error("shard snapshot failed: {0}")]
    ShardSnapshotFailed(String),
    #[error("snapshot was aborted by a deletion")]
    SnapshotAborted,
    #[error("failed to access the blob store")]
    Store(#[from] store::Error),
    #[error("storage I/O failure")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the caller may transparently retry the operation against the (possibly new)
    /// master.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::MasterLost)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
