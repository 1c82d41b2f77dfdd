//! Membership: snapshot install for a brand-new peer, add-peer growth of the
//! cluster, and the reserved remove-peer operation.


use std::time::Duration;

use bytes::Bytes;
use raftcell::storage::read_peer_state;
use raftcell::{EntryType, NodeId, RaftError, Wal};
use test_harness::{wait_for, TestCluster};

/// Scenario: the leader snapshots and compacts, then a new peer joins. The
/// newcomer is reset from the snapshot entry and replicates forward; once
/// caught up it is proposed into the membership, growing size and quorum on
/// every node (and on disk).
#[tokio::test]
async fn test_new_peer_joins_via_snapshot_and_add_peer() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    // Build some history and apply it everywhere, the leader included (the
    // snapshot call below requires the leader to be fully applied).
    for i in 0..5 {
        cluster.propose(format!("h{}", i).as_bytes()).await;
    }
    for i in 0..3 {
        cluster.nodes[i]
            .wait_for_payload(b"h4", Duration::from_secs(5))
            .await
            .unwrap();
    }

    // Snapshot on the leader. Applying the snapshot entry compacts the WAL
    // behind it on each node.
    let leader_node = &cluster.nodes[leader].node;
    let snap_ok = wait_for(
        move || async move {
            leader_node
                .snapshot(Bytes::from_static(b"SNAPSHOT"))
                .await
                .is_ok()
        },
        Duration::from_secs(5),
        Duration::from_millis(30),
    )
    .await;
    assert!(snap_ok, "leader should accept the snapshot");

    let mut snap_index = 0;
    for i in 0..3 {
        if i == leader {
            continue;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let ce = cluster.nodes[i]
                .next_committed(remaining)
                .await
                .expect("snapshot apply record");
            if ce.entries.iter().any(|e| e.kind == EntryType::Snapshot) {
                snap_index = ce.index;
                break;
            }
        }
    }
    assert!(snap_index > 0);

    // The followers confirmed application, which compacts their logs so the
    // snapshot entry is the first record left.
    for i in 0..3 {
        if i == leader {
            continue;
        }
        let wal = &cluster.nodes[i].wal;
        let ok = wait_for(
            move || async move { wal.state().first_seq == snap_index },
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await;
        assert!(ok, "snapshot application should compact the log");
    }

    // A brand-new peer joins the bus. It was never bootstrapped into the
    // original membership.
    let newcomer_id = NodeId::from_hash("newpeer1");
    let newcomer = cluster.add_node(newcomer_id).await;

    // Its first apply record is the snapshot entry, then history continues.
    let first = cluster.nodes[newcomer]
        .next_committed(Duration::from_secs(10))
        .await
        .expect("newcomer should receive the snapshot");
    assert_eq!(first.index, snap_index);
    assert_eq!(first.entries[0].kind, EntryType::Snapshot);
    assert_eq!(first.entries[0].data.as_ref(), b"SNAPSHOT");

    // Catch-up completion proposes AddPeer: everyone converges on a larger
    // cluster with a larger quorum.
    for tn in &cluster.nodes {
        let node = &tn.node;
        let ok = wait_for(
            move || async move { node.cluster_size().await == 4 && node.quorum_size().await == 3 },
            Duration::from_secs(10),
            Duration::from_millis(30),
        )
        .await;
        assert!(ok, "cluster should grow to 4 with quorum 3");
    }

    // The grown membership reached the peer-state files of the original
    // members.
    for i in 0..3 {
        let dir = cluster.nodes[i].dir.path();
        let ok = wait_for(
            move || async move {
                read_peer_state(dir)
                    .map(|ps| ps.cluster_size == 4)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
            Duration::from_millis(30),
        )
        .await;
        assert!(ok, "peer-state file should record 4 members");
    }

    // And the group still commits with the newcomer participating.
    cluster.propose(b"post-join").await;
    cluster.nodes[newcomer]
        .wait_for_payload(b"post-join", Duration::from_secs(5))
        .await
        .expect("newcomer replicates new entries");
}

#[tokio::test]
async fn test_add_peer_requires_leader() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let follower = (0..3).find(|&i| i != leader).unwrap();

    assert!(matches!(
        cluster.nodes[follower]
            .node
            .propose_add_peer(NodeId::from_hash("whomever"))
            .await,
        Err(RaftError::NotLeader)
    ));
}

#[tokio::test]
async fn test_remove_peer_is_reserved() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    assert!(matches!(
        cluster.nodes[leader]
            .node
            .propose_remove_peer(cluster.nodes[(leader + 1) % 3].id)
            .await,
        Err(RaftError::RemovePeerUnsupported)
    ));
}
