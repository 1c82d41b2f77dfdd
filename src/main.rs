use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use raftcell::{
    bootstrap_group, ApplyEvent, EntryType, MemoryBus, MemoryWal, NodeId, RaftConfig, RaftNode,
};

#[derive(Parser, Debug)]
#[command(name = "raftcell")]
#[command(about = "Run a small in-process consensus group and watch it commit")]
struct Args {
    /// Number of nodes in the group
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Number of payloads to propose once a leader is elected
    #[arg(long, default_value = "5")]
    proposals: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.nodes < 2 {
        return Err("a group needs at least two nodes".into());
    }

    let bus = MemoryBus::new();
    let ids: Vec<NodeId> = (0..args.nodes)
        .map(|i| NodeId::from_hash(&format!("node{:04}", i)))
        .collect();
    let base = std::env::temp_dir().join(format!("raftcell-demo-{}", std::process::id()));

    let mut nodes = Vec::new();
    for (i, &id) in ids.iter().enumerate() {
        let dir = base.join(format!("n{}", i));
        bootstrap_group(&dir, &ids, ids.len())?;
        let cfg = RaftConfig::new("demo", "smoke", &dir);
        let wal = Arc::new(MemoryWal::new());
        let transport = Arc::new(bus.endpoint(id.to_string()));
        let (node, apply_rx) = RaftNode::start(cfg, id, wal, transport).await?;
        nodes.push(node.clone());

        // Each node prints what its state machine applies.
        tokio::spawn(consume_applies(i, node, apply_rx));
    }

    let leader = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .ok_or("no leader elected")?;
    tracing::info!(leader = %leader.id(), "leader elected");

    for i in 0..args.proposals {
        leader
            .propose(Bytes::from(format!("payload-{}", i)))
            .await?;
    }

    // Give the group a moment to replicate and apply everywhere.
    tokio::time::sleep(Duration::from_secs(2)).await;
    for node in &nodes {
        let pos = node.position().await;
        tracing::info!(
            id = %node.id(),
            role = %node.role().await,
            term = pos.term,
            commit = pos.commit,
            applied = pos.applied,
            "final state"
        );
    }

    for node in &nodes {
        node.stop().await;
    }
    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

async fn consume_applies(
    idx: usize,
    node: RaftNode,
    mut apply_rx: tokio::sync::mpsc::Receiver<ApplyEvent>,
) {
    while let Some(event) = apply_rx.recv().await {
        match event {
            ApplyEvent::ReplayComplete => {}
            ApplyEvent::Committed(ce) => {
                for entry in &ce.entries {
                    if entry.kind == EntryType::Normal {
                        tracing::info!(
                            node = idx,
                            index = ce.index,
                            payload = %String::from_utf8_lossy(&entry.data),
                            "applied"
                        );
                    }
                }
                node.applied(ce.index).await;
            }
        }
    }
}

async fn wait_for_leader(nodes: &[RaftNode], timeout: Duration) -> Option<RaftNode> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        for node in nodes {
            if node.is_leader().await {
                return Some(node.clone());
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}
