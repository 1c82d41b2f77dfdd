//! Out-of-band catch-up of followers that fell behind.


use std::time::Duration;

use bytes::Bytes;
use raftcell::EntryType;
use test_harness::{wait_for, TestCluster};

/// A follower cut off while the group commits a batch of entries comes back,
/// negative-acks the next heartbeat and is streamed the missing history.
#[tokio::test]
async fn test_stale_follower_catches_up() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let stale = (0..3).find(|&i| i != leader).unwrap();

    // Make sure the follower has something in its log first.
    cluster.nodes[leader]
        .node
        .propose(Bytes::from_static(b"seed"))
        .await
        .unwrap();
    cluster.nodes[stale]
        .wait_for_payload(b"seed", Duration::from_secs(5))
        .await
        .unwrap();

    cluster.isolate(stale);

    // Commit a pile of entries on the majority side.
    for i in 0..20 {
        cluster.propose(format!("bulk-{}", i).as_bytes()).await;
        // Keep proposals from coalescing so the gap is many frames wide.
        if i % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    let witness = (0..3).find(|&i| i != leader && i != stale).unwrap();
    cluster.nodes[witness]
        .wait_for_payload(b"bulk-19", Duration::from_secs(10))
        .await
        .expect("majority should commit the batch");

    cluster.reconnect(stale);

    // The stale node replays the gap in order through its apply channel.
    let mut last_index = 0;
    let mut payloads = Vec::new();
    let deadline = Duration::from_secs(15);
    while !payloads.contains(&b"bulk-19".to_vec()) {
        let ce = cluster.nodes[stale]
            .next_committed(deadline)
            .await
            .expect("catch-up apply records");
        assert!(ce.index > last_index, "apply order must be increasing");
        last_index = ce.index;
        for e in &ce.entries {
            if e.kind == EntryType::Normal {
                payloads.push(e.data.to_vec());
            }
        }
    }

    // All twenty arrived, in proposal order.
    let bulk: Vec<Vec<u8>> = payloads
        .into_iter()
        .filter(|p| p.starts_with(b"bulk-"))
        .collect();
    assert_eq!(bulk.len(), 20);
    for (i, p) in bulk.iter().enumerate() {
        assert_eq!(p, format!("bulk-{}", i).as_bytes());
    }

    // And the node ends current, at the leader's position.
    let leader_node = &cluster.nodes[leader].node;
    let stale_node = &cluster.nodes[stale].node;
    let ok = wait_for(
        move || async move {
            stale_node.position().await.pindex == leader_node.position().await.pindex
        },
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await;
    assert!(ok, "stale follower should reach the leader's pindex");
}

/// A node restarted from an old WAL catches up the same way.
#[tokio::test]
async fn test_restarted_follower_catches_up() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let follower = (0..3).find(|&i| i != leader).unwrap();

    cluster.nodes[leader]
        .node
        .propose(Bytes::from_static(b"early"))
        .await
        .unwrap();
    cluster.nodes[follower]
        .wait_for_payload(b"early", Duration::from_secs(5))
        .await
        .unwrap();

    cluster.stop_node(follower).await;

    for i in 0..10 {
        cluster.propose(format!("while-down-{}", i).as_bytes()).await;
    }
    let witness = (0..3).find(|&i| i != leader && i != follower).unwrap();
    cluster.nodes[witness]
        .wait_for_payload(b"while-down-9", Duration::from_secs(10))
        .await
        .unwrap();

    cluster.restart_node(follower).await;

    cluster.nodes[follower]
        .wait_for_payload(b"while-down-9", Duration::from_secs(15))
        .await
        .expect("restarted follower should catch up");

    let leader_node = &cluster.nodes[leader].node;
    let follower_node = &cluster.nodes[follower].node;
    let ok = wait_for(
        move || async move {
            let lp = leader_node.position().await;
            let fp = follower_node.position().await;
            fp.pindex == lp.pindex && follower_node.is_current().await
        },
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await;
    assert!(ok, "restarted follower should end current");
}
