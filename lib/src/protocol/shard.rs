use super::{NodeId, ShardGeneration};
use serde::{Deserialize, Serialize};

/// State of a single shard inside an in-progress snapshot entry.
///
/// `Aborted` is not terminal: the master flips a shard to `Aborted` and waits for the assigned
/// node to acknowledge with the actual outcome (or for the node to leave the cluster).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ShardState {
    /// Assigned to a node, upload not yet reported finished.
    Init,
    Success,
    Failed,
    /// Abort requested, waiting for the node to stop the upload.
    Aborted,
    /// No primary could be found for the shard (index closed, node lost).
    Missing,
    /// The primary exists but is not currently assignable. Re-evaluated on routing changes.
    Waiting,
    /// The same shard is busy in an older entry, or an older deletion holds the repository.
    Queued,
    /// The assigned node carries a shutdown-for-removal marker.
    PausedForNodeRemoval,
}

impl ShardState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Missing)
    }

    /// Whether the shard counts against a successful snapshot in the completion rollup.
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, Self::Failed | Self::Missing)
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ShardSnapshotStatus {
    pub state: ShardState,
    pub node: Option<NodeId>,
    /// The shard generation issued to the upload (for `Init`) or produced by it (for `Success`).
    pub generation: Option<ShardGeneration>,
    pub failure: Option<String>,
}

impl ShardSnapshotStatus {
    pub fn init(node: NodeId, generation: ShardGeneration) -> Self {
        Self {
            state: ShardState::Init,
            node: Some(node),
            generation: Some(generation),
            failure: None,
        }
    }

    pub fn success(node: NodeId, generation: ShardGeneration) -> Self {
        Self {
            state: ShardState::Success,
            node: Some(node),
            generation: Some(generation),
            failure: None,
        }
    }

    pub fn failed(node: Option<NodeId>, reason: impl Into<String>) -> Self {
        Self {
            state: ShardState::Failed,
            node,
            generation: None,
            failure: Some(reason.into()),
        }
    }

    pub fn missing(reason: impl Into<String>) -> Self {
        Self {
            state: ShardState::Missing,
            node: None,
            generation: None,
            failure: Some(reason.into()),
        }
    }

    /// `generation` is the last generation known for the shard, issued once the shard gets a
    /// node assignment.
    pub fn waiting(generation: Option<ShardGeneration>) -> Self {
        Self {
            state: ShardState::Waiting,
            node: None,
            generation,
            failure: None,
        }
    }

    /// `generation` is the last generation known for the shard at enqueue time. It is carried
    /// through so the shard can be promoted even when every older holder failed without
    /// producing a new one.
    pub fn queued(generation: Option<ShardGeneration>) -> Self {
        Self {
            state: ShardState::Queued,
            node: None,
            generation,
            failure: None,
        }
    }

    pub fn aborted(self) -> Self {
        Self {
            state: ShardState::Aborted,
            ..self
        }
    }

    pub fn paused(self) -> Self {
        Self {
            state: ShardState::PausedForNodeRemoval,
            ..self
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
