use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Monotonic counter identifying the repository's root `index-N` metadata blob. Negative values
/// are sentinels that never appear in blob names.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepositoryGeneration(pub i64);

impl RepositoryGeneration {
    /// A freshly created repository with no `index-N` blob yet.
    pub const EMPTY: Self = Self(-1);
    /// The generation has not been read from the blob store yet.
    pub const UNKNOWN: Self = Self(-2);
    /// The repository is quarantined after an unreadable or unexpectedly mutated root blob.
    pub const CORRUPTED: Self = Self(-3);

    pub fn next(self) -> Self {
        debug_assert!(self >= Self::EMPTY);
        Self(self.0 + 1)
    }

    pub fn is_sentinel(self) -> bool {
        self.0 < Self::EMPTY.0
    }
}

impl fmt::Display for RepositoryGeneration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::UNKNOWN => write!(f, "unknown"),
            Self::CORRUPTED => write!(f, "corrupted"),
            _ => write!(f, "{}", self.0),
        }
    }
}

impl fmt::Debug for RepositoryGeneration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Why a repository was quarantined. Kept in the cluster state so every subsequent operation on
/// the repository reports the same error until an operator re-registers it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuarantineReason {
    Inconsistent {
        expected: RepositoryGeneration,
        actual: RepositoryGeneration,
    },
    Corrupt {
        generation: RepositoryGeneration,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySettings {
    /// Backing location: a directory path for filesystem repositories, an arbitrary key for
    /// in-memory ones. Repositories registered with the same kind and location share contents.
    pub location: String,
}

/// Descriptor plus generation tracking for one registered repository.
#[derive(Clone, Debug)]
pub struct RepositoryMetadata {
    pub name: String,
    pub kind: String,
    pub settings: RepositorySettings,
    /// The latest generation known to be safely written (`G`).
    pub generation: RepositoryGeneration,
    /// The generation an in-flight root metadata write is producing. Invariant:
    /// `pending_generation >= generation` whenever both are non-sentinel.
    pub pending_generation: RepositoryGeneration,
    /// FIFO order of the entry performing the in-flight write. Lets a new master resolve
    /// which entry's write it inherited without re-deriving it from a registry that may have
    /// moved on.
    pub pending_order: Option<u64>,
    pub quarantine: Option<QuarantineReason>,
}

impl RepositoryMetadata {
    pub fn new(name: String, kind: String, settings: RepositorySettings) -> Self {
        Self {
            name,
            kind,
            settings,
            generation: RepositoryGeneration::UNKNOWN,
            pending_generation: RepositoryGeneration::UNKNOWN,
            pending_order: None,
            quarantine: None,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }
}

/// Cluster-state section listing all registered repositories.
#[derive(Clone, Debug, Default)]
pub struct RepositoriesMetadata {
    repositories: BTreeMap<String, RepositoryMetadata>,
}

impl RepositoriesMetadata {
    pub fn get(&self, name: &str) -> Option<&RepositoryMetadata> {
        self.repositories.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut RepositoryMetadata> {
        self.repositories.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RepositoryMetadata> {
        self.repositories.values()
    }

    pub fn insert(&mut self, metadata: RepositoryMetadata) {
        self.repositories.insert(metadata.name.clone(), metadata);
    }

    pub fn remove(&mut self, name: &str) -> Option<RepositoryMetadata> {
        self.repositories.remove(name)
    }
}
