//! End-to-end scenarios driven through the in-process cluster: concurrent creates and deletes,
//! batching, cascaded aborts, master failover, corrupted and externally mutated repositories.

use crate::{
    cluster::{Client, Cluster, CreateOptions},
    error::Error,
    protocol::{
        DeletionState, NodeId, NodeShutdownKind, RepositoryGeneration, RepositorySettings,
        ShardState, SnapshotState,
    },
    test_utils,
};
use assert_matches::assert_matches;
use std::{future::Future, time::Duration};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("test timed out")
}

fn single_node_cluster() -> (Cluster, Client) {
    test_utils::init_log();
    let cluster = Cluster::builder()
        .add_master_node("m1")
        .add_data_node("d1")
        .build();
    let client = cluster.client();
    (cluster, client)
}

async fn put_repo(client: &Client, name: &str) {
    client
        .put_repository(
            name,
            "memory",
            RepositorySettings {
                location: name.to_owned(),
            },
        )
        .await
        .unwrap();
}

fn create_in(indices: &[&str]) -> CreateOptions {
    CreateOptions {
        indices: Some(indices.iter().map(|s| (*s).to_owned()).collect()),
        ..CreateOptions::default()
    }
}

fn generation(cluster: &Cluster, repo: &str) -> RepositoryGeneration {
    cluster
        .state()
        .repositories
        .get(repo)
        .unwrap()
        .generation
}

#[tokio::test(flavor = "multi_thread")]
async fn create_snapshot_on_empty_repository() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    let info = within(client.create_snapshot("repo", "snap", create_in(&["idx"])))
        .await
        .unwrap();

    assert_eq!(info.state, SnapshotState::Success);
    assert_eq!(info.total_shards, 1);
    assert!(info.failures.is_empty());

    // The empty repository was at generation -1; the first snapshot writes generation 0.
    assert_eq!(generation(&cluster, "repo"), RepositoryGeneration(0));

    let listed = within(client.get_snapshots("repo", &["*"])).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].snapshot.name, "snap");
}

#[tokio::test(flavor = "multi_thread")]
async fn wildcard_delete_on_empty_repository_acknowledges_without_generation_change() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;

    within(client.delete_snapshots("repo", &["*"])).await.unwrap();

    assert_eq!(generation(&cluster, "repo"), RepositoryGeneration::EMPTY);
    assert!(within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_of_missing_concrete_name_fails() {
    let (_cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;

    assert_matches!(
        within(client.delete_snapshots("repo", &["nope"])).await,
        Err(Error::SnapshotMissing(name)) if name == "nope"
    );
    assert_matches!(
        within(client.create_snapshot("missing", "snap", CreateOptions::default())).await,
        Err(Error::RepositoryMissing(_))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn filesystem_backed_repository_roundtrip() {
    let (cluster, client) = single_node_cluster();
    let dir = tempfile::TempDir::new().unwrap();

    client
        .put_repository(
            "repo",
            "fs",
            RepositorySettings {
                location: dir.path().to_string_lossy().into_owned(),
            },
        )
        .await
        .unwrap();
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    let info = within(client.create_snapshot("repo", "snap", create_in(&["idx"])))
        .await
        .unwrap();
    assert_eq!(info.state, SnapshotState::Success);
    assert_eq!(generation(&cluster, "repo"), RepositoryGeneration(0));
    assert!(dir.path().join("index-0").exists());
    assert!(dir.path().join("index.latest").exists());

    within(client.delete_snapshots("repo", &["snap"]))
        .await
        .unwrap();
    assert_eq!(generation(&cluster, "repo"), RepositoryGeneration(1));
    assert!(within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn get_snapshots_reports_in_progress_under_current() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    cluster.block_repository_on_node(&NodeId::from("d1"), "repo");

    let info = within(client.create_snapshot(
        "repo",
        "snap",
        CreateOptions {
            indices: Some(vec!["idx".to_owned()]),
            wait_for_completion: false,
            ..CreateOptions::default()
        },
    ))
    .await
    .unwrap();
    assert_eq!(info.state, SnapshotState::InProgress);

    let current = within(client.get_snapshots("repo", &["_current"]))
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].snapshot.name, "snap");
    assert_eq!(current[0].state, SnapshotState::InProgress);

    cluster.unblock_repository_on_node(&NodeId::from("d1"), "repo");
    within(cluster.wait_for_state(|state| !state.repository_in_use("repo"))).await;

    let done = within(client.get_snapshots("repo", &["snap"])).await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].state, SnapshotState::Success);
}

// Scenario: a blocked upload in one repository must not hold back another repository.
#[tokio::test(flavor = "multi_thread")]
async fn independent_creates_across_repositories() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "a").await;
    put_repo(&client, "b").await;
    client
        .put_index("idx-a", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();
    client
        .put_index("idx-b", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    cluster.block_repository_on_node(&NodeId::from("d1"), "a");

    let slow_client = client.clone();
    let slow = tokio::spawn(async move {
        slow_client
            .create_snapshot("a", "slow", create_in(&["idx-a"]))
            .await
    });

    // `fast` completes while `slow` is still pinned at the data node.
    let fast = within(client.create_snapshot("b", "fast", create_in(&["idx-b"])))
        .await
        .unwrap();
    assert_eq!(fast.state, SnapshotState::Success);
    assert!(cluster.state().snapshots.for_repository("a").next().is_some());

    cluster.unblock_repository_on_node(&NodeId::from("d1"), "a");

    let slow = within(slow).await.unwrap().unwrap();
    assert_eq!(slow.state, SnapshotState::Success);
}

// Scenario: two delete requests over four snapshots batch into two metadata rewrites.
#[tokio::test(flavor = "multi_thread")]
async fn batched_deletes() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    for i in 0..4 {
        let info = within(client.create_snapshot("repo", &format!("snap-{i}"), create_in(&["idx"])))
            .await
            .unwrap();
        assert_eq!(info.state, SnapshotState::Success);
    }
    let initial = generation(&cluster, "repo");

    within(client.delete_snapshots("repo", &["snap-0", "snap-2"]))
        .await
        .unwrap();
    within(client.delete_snapshots("repo", &["snap-1", "snap-3"]))
        .await
        .unwrap();

    assert_eq!(
        generation(&cluster, "repo"),
        RepositoryGeneration(initial.0 + 2)
    );
    assert!(within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .is_empty());
}

// Scenario: deleting a blocked snapshot aborts it while queued snapshots behind it survive.
#[tokio::test(flavor = "multi_thread")]
async fn cascaded_abort() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    cluster.block_repository_on_node(&NodeId::from("d1"), "repo");

    let spawn_create = |name: &str| {
        let client = client.clone();
        let name = name.to_owned();
        tokio::spawn(async move {
            client
                .create_snapshot("repo", &name, create_in(&["idx"]))
                .await
        })
    };

    let one = spawn_create("one");
    within(cluster.wait_for_state(|state| {
        state
            .snapshots
            .for_repository("repo")
            .any(|entry| entry.snapshot.name == "one")
    }))
    .await;

    let two = spawn_create("two");
    let three = spawn_create("three");
    within(cluster.wait_for_state(|state| {
        state.snapshots.for_repository("repo").count() == 3
    }))
    .await;

    within(client.delete_snapshots("repo", &["one"]))
        .await
        .unwrap();

    let one = within(one).await.unwrap().unwrap();
    assert_eq!(one.state, SnapshotState::Failed);

    cluster.unblock_repository_on_node(&NodeId::from("d1"), "repo");

    let two = within(two).await.unwrap().unwrap();
    let three = within(three).await.unwrap().unwrap();
    assert_eq!(two.state, SnapshotState::Success);
    assert_eq!(three.state, SnapshotState::Success);

    let names: Vec<String> = within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.snapshot.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"two".to_owned()));
    assert!(names.contains(&"three".to_owned()));

    within(client.delete_snapshots("repo", &["*"])).await.unwrap();
    assert!(within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .is_empty());
}

// Scenario: a wildcard delete over N in-flight creates aborts all of them and advances the
// generation by N + 1: one failed-snapshot record per aborted create plus the delete itself.
#[tokio::test(flavor = "multi_thread")]
async fn wildcard_delete_aborts_concurrent_creates() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    cluster.block_repository_on_node(&NodeId::from("d1"), "repo");

    let mut creates = Vec::new();
    for i in 0..3 {
        let client = client.clone();
        let name = format!("c{i}");
        creates.push(tokio::spawn(async move {
            client
                .create_snapshot("repo", &name, create_in(&["idx"]))
                .await
        }));
    }
    within(cluster.wait_for_state(|state| {
        state.snapshots.for_repository("repo").count() == 3
    }))
    .await;

    within(client.delete_snapshots("repo", &["*"])).await.unwrap();

    for create in creates {
        let info = within(create).await.unwrap().unwrap();
        assert_eq!(info.state, SnapshotState::Failed);
    }

    // From the empty repository (-1): three aborted-create finalizations plus one delete.
    assert_eq!(generation(&cluster, "repo"), RepositoryGeneration(3));
    assert!(within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .is_empty());
}

// Scenario: queued deletes and creates survive a master failover; the new master re-drives
// aborts and finalizations from the published state.
#[tokio::test(flavor = "multi_thread")]
async fn master_failover_with_queued_deletes() {
    test_utils::init_log();
    let cluster = Cluster::builder()
        .add_master_node("m1")
        .add_master_node("m2")
        .add_master_node("m3")
        .add_data_node("d1")
        .add_data_node("d2")
        .build();
    let client = cluster.client();

    put_repo(&client, "repo").await;
    client
        .put_index("idx1", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();
    client
        .put_index("idx2", vec![Some(NodeId::from("d2"))])
        .await
        .unwrap();

    // Hold d1's acknowledgements: `one` can upload but never reach a terminal state, so the
    // deletion naming it stays queued across the failover.
    cluster.hold_shard_reports(&NodeId::from("d1"));

    let one = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .create_snapshot("repo", "one", create_in(&["idx1"]))
                .await
        })
    };
    within(cluster.wait_for_state(|state| {
        state
            .snapshots
            .for_repository("repo")
            .any(|entry| entry.snapshot.name == "one")
    }))
    .await;

    let two = within(client.create_snapshot("repo", "two", create_in(&["idx2"])))
        .await
        .unwrap();
    assert_eq!(two.state, SnapshotState::Success);

    let delete_one = {
        let client = client.clone();
        tokio::spawn(async move { client.delete_snapshots("repo", &["one"]).await })
    };
    within(cluster.wait_for_state(|state| {
        state.deletions.for_repository("repo").next().is_some()
    }))
    .await;

    cluster.block_repository_on_node(&NodeId::from("d2"), "repo");
    let three = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .create_snapshot("repo", "three", create_in(&["idx2"]))
                .await
        })
    };
    within(cluster.wait_for_state(|state| {
        state
            .snapshots
            .for_repository("repo")
            .any(|entry| entry.snapshot.name == "three")
    }))
    .await;

    let delete_all = {
        let client = client.clone();
        tokio::spawn(async move { client.delete_snapshots("repo", &["*"]).await })
    };
    within(cluster.wait_for_state(|state| {
        state
            .deletions
            .for_repository("repo")
            .any(|entry| entry.snapshots.len() >= 3)
    }))
    .await;

    // The registries carry the whole backlog at the moment the master dies; the new master
    // inherits them wholesale from the published state.
    let pre_failover = cluster.state();
    assert!(pre_failover.snapshots.for_repository("repo").next().is_some());
    assert!(pre_failover.deletions.for_repository("repo").next().is_some());

    let new_master = cluster.stop_master().await;
    assert_eq!(new_master, Some(NodeId::from("m2")));

    cluster.release_shard_reports(&NodeId::from("d1"));
    cluster.unblock_repository_on_node(&NodeId::from("d2"), "repo");

    // The old master owned the create waiters; both complete with a retriable error.
    assert_matches!(within(one).await.unwrap(), Err(Error::MasterLost));
    assert_matches!(within(three).await.unwrap(), Err(Error::MasterLost));

    // The deletes re-resolve the new master and acknowledge.
    within(delete_one).await.unwrap().unwrap();
    within(delete_all).await.unwrap().unwrap();

    within(cluster.wait_for_state(|state| !state.repository_in_use("repo"))).await;
    assert!(within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .is_empty());
}

// Scenario: an unreadable root blob quarantines the repository, under its original name and
// under any re-mount of the same contents.
#[tokio::test(flavor = "multi_thread")]
async fn corrupted_root_blob_quarantines_repository() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    within(client.create_snapshot("repo", "snap", create_in(&["idx"])))
        .await
        .unwrap();

    let store = cluster.memory_store("repo").unwrap();
    store.put_raw("index-0", b"\xfe\xed\xfa\xce not json".to_vec());

    assert_matches!(
        within(client.create_snapshot("repo", "snap2", create_in(&["idx"]))).await,
        Err(Error::CorruptRepository { .. })
    );
    assert_matches!(
        within(client.delete_snapshots("repo", &["*"])).await,
        Err(Error::CorruptRepository { .. })
    );

    // Re-mounting the same contents under a new name exhibits the same error.
    client
        .put_repository(
            "remounted",
            "memory",
            RepositorySettings {
                location: "repo".to_owned(),
            },
        )
        .await
        .unwrap();
    assert_matches!(
        within(client.create_snapshot("remounted", "snap3", create_in(&["idx"]))).await,
        Err(Error::CorruptRepository { .. })
    );
}

// Scenario: an out-of-band rename of the root blob fails everything with a distinct error
// until the repository descriptor is deleted and re-created.
#[tokio::test(flavor = "multi_thread")]
async fn external_generation_bump_quarantines_until_reregistered() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    within(client.create_snapshot("repo", "snap", create_in(&["idx"])))
        .await
        .unwrap();

    let store = cluster.memory_store("repo").unwrap();
    assert!(store.rename_raw("index-0", "index-1"));

    assert_matches!(
        within(client.create_snapshot("repo", "snap2", create_in(&["idx"]))).await,
        Err(Error::RepositoryInconsistent {
            expected: RepositoryGeneration(0),
            actual: RepositoryGeneration(1),
            ..
        })
    );
    assert_matches!(
        within(client.delete_snapshots("repo", &["*"])).await,
        Err(Error::RepositoryInconsistent { .. })
    );

    // Deleting and re-creating the descriptor adopts the store contents as the new truth.
    client.delete_repository("repo").await.unwrap();
    put_repo(&client, "repo").await;

    let info = within(client.create_snapshot("repo", "snap2", create_in(&["idx"])))
        .await
        .unwrap();
    assert_eq!(info.state, SnapshotState::Success);
    assert_eq!(generation(&cluster, "repo"), RepositoryGeneration(2));

    let names: Vec<String> = within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.snapshot.name)
        .collect();
    assert!(names.contains(&"snap".to_owned()));
    assert!(names.contains(&"snap2".to_owned()));
}

// A shard whose index disappears while it waits for a primary goes missing; with `partial`
// set the snapshot still completes, degraded.
#[tokio::test(flavor = "multi_thread")]
async fn missing_shard_degrades_partial_snapshot() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    // One routed index and one whose single shard has no primary.
    client
        .put_index("routed", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();
    client.put_index("limbo", vec![None]).await.unwrap();

    let create = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .create_snapshot(
                    "repo",
                    "snap",
                    CreateOptions {
                        indices: Some(vec!["routed".to_owned(), "limbo".to_owned()]),
                        partial: true,
                        ..CreateOptions::default()
                    },
                )
                .await
        })
    };
    within(cluster.wait_for_state(|state| {
        state
            .snapshots
            .for_repository("repo")
            .any(|entry| entry
                .shards
                .values()
                .any(|status| status.state == ShardState::Waiting))
    }))
    .await;

    client.remove_index("limbo").await.unwrap();

    let info = within(create).await.unwrap().unwrap();
    assert_eq!(info.state, SnapshotState::Partial);
    assert_eq!(info.total_shards, 2);
    assert_eq!(info.failed_shards(), 1);
}

// A node with a shutdown-for-removal marker pauses its uploads; clearing the marker before
// allocation moved the shard resumes it in place.
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_marker_pauses_and_resumes_shard() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    cluster.block_repository_on_node(&NodeId::from("d1"), "repo");

    let create = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .create_snapshot("repo", "snap", create_in(&["idx"]))
                .await
        })
    };
    within(cluster.wait_for_state(|state| {
        state
            .snapshots
            .for_repository("repo")
            .any(|entry| entry
                .shards
                .values()
                .any(|status| status.state == ShardState::Init))
    }))
    .await;

    client
        .set_shutdown(&NodeId::from("d1"), NodeShutdownKind::Remove, "draining")
        .await
        .unwrap();
    within(cluster.wait_for_state(|state| {
        state
            .snapshots
            .for_repository("repo")
            .any(|entry| entry
                .shards
                .values()
                .any(|status| status.state == ShardState::PausedForNodeRemoval))
    }))
    .await;

    client.clear_shutdown(&NodeId::from("d1")).await.unwrap();
    cluster.unblock_repository_on_node(&NodeId::from("d1"), "repo");

    let info = within(create).await.unwrap().unwrap();
    assert_eq!(info.state, SnapshotState::Success);
}

// Deletions arriving while an earlier batch is waiting fold into it and share its outcome.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_deletes_fold_into_one_batch() {
    let (cluster, client) = single_node_cluster();
    put_repo(&client, "repo").await;
    client
        .put_index("idx", vec![Some(NodeId::from("d1"))])
        .await
        .unwrap();

    for name in ["one", "two"] {
        within(client.create_snapshot("repo", name, create_in(&["idx"])))
            .await
            .unwrap();
    }

    // Hold the node's acknowledgements: the pinned create cannot reach a terminal state, so
    // the deletion that names it stays in its waiting, foldable phase.
    cluster.hold_shard_reports(&NodeId::from("d1"));
    let pinned = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .create_snapshot("repo", "pinned", create_in(&["idx"]))
                .await
        })
    };
    within(cluster.wait_for_state(|state| {
        state
            .snapshots
            .for_repository("repo")
            .any(|entry| entry.snapshot.name == "pinned")
    }))
    .await;

    let delete_pinned = {
        let client = client.clone();
        tokio::spawn(async move { client.delete_snapshots("repo", &["pinned"]).await })
    };
    within(cluster.wait_for_state(|state| {
        state
            .deletions
            .for_repository("repo")
            .any(|entry| entry.state == DeletionState::Waiting)
    }))
    .await;

    let delete_rest = {
        let client = client.clone();
        tokio::spawn(async move { client.delete_snapshots("repo", &["one", "two"]).await })
    };
    within(cluster.wait_for_state(|state| {
        state
            .deletions
            .for_repository("repo")
            .any(|entry| entry.snapshots.len() == 3)
    }))
    .await;
    // Still one batch.
    assert_eq!(cluster.state().deletions.for_repository("repo").count(), 1);

    cluster.release_shard_reports(&NodeId::from("d1"));

    within(delete_pinned).await.unwrap().unwrap();
    within(delete_rest).await.unwrap().unwrap();
    assert_matches!(
        within(pinned).await.unwrap().unwrap().state,
        SnapshotState::Failed
    );

    assert!(within(client.get_snapshots("repo", &["*"]))
        .await
        .unwrap()
        .is_empty());
}
