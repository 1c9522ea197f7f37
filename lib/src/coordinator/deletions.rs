//! Resolution of delete requests: wildcard matching against both the completed snapshots in
//! the repository data and the in-progress registry.

use crate::{
    protocol::{ClusterState, SnapshotId},
    repository::RepositoryData,
};

/// Matches `*` (any run) and `?` (any single character), anchored at both ends.
pub(crate) fn name_matches(pattern: &str, name: &str) -> bool {
    fn rec(pattern: &[u8], name: &[u8]) -> bool {
        match pattern.first() {
            None => name.is_empty(),
            Some(b'*') => {
                rec(&pattern[1..], name) || (!name.is_empty() && rec(pattern, &name[1..]))
            }
            Some(b'?') => !name.is_empty() && rec(&pattern[1..], &name[1..]),
            Some(c) => name.first() == Some(c) && rec(&pattern[1..], &name[1..]),
        }
    }

    rec(pattern.as_bytes(), name.as_bytes())
}

pub(crate) fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

pub(crate) struct Resolution {
    /// Snapshots the request resolves to, completed and in-progress alike, deduplicated.
    pub snapshots: Vec<SnapshotId>,
    /// Concrete (non-wildcard) names that matched nothing.
    pub unmatched: Vec<String>,
}

/// Resolves delete patterns against the repository's completed snapshots and the in-progress
/// registry. Wildcards that match nothing resolve to the empty set; concrete names that match
/// nothing are reported so the caller can fail with `SnapshotMissing`.
pub(crate) fn resolve(
    state: &ClusterState,
    repository: &str,
    patterns: &[String],
    data: &RepositoryData,
) -> Resolution {
    let mut snapshots: Vec<SnapshotId> = Vec::new();
    let mut unmatched = Vec::new();

    let mut push = |id: SnapshotId, snapshots: &mut Vec<SnapshotId>| {
        if !snapshots.iter().any(|existing| existing.uuid == id.uuid) {
            snapshots.push(id);
        }
    };

    for pattern in patterns {
        let mut matched = false;

        for record in &data.snapshots {
            if name_matches(pattern, &record.name) {
                matched = true;
                push(
                    SnapshotId {
                        name: record.name.clone(),
                        uuid: record.uuid,
                    },
                    &mut snapshots,
                );
            }
        }

        for entry in state.snapshots.for_repository(repository) {
            if name_matches(pattern, &entry.snapshot.name) {
                matched = true;
                push(entry.snapshot.clone(), &mut snapshots);
            }
        }

        if !matched && !is_wildcard(pattern) {
            unmatched.push(pattern.clone());
        }
    }

    Resolution {
        snapshots,
        unmatched,
    }
}
