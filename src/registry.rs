//! Host-side registry of the consensus groups running in one server
//! process. Owned by the host, one instance per server; nothing here is
//! global.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::node::RaftNode;

#[derive(Default)]
pub struct RaftRegistry {
    nodes: RwLock<HashMap<String, RaftNode>>,
}

impl RaftRegistry {
    pub fn new() -> Self {
        RaftRegistry {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a node under its group name, replacing any previous entry.
    pub async fn register(&self, node: RaftNode) {
        let mut nodes = self.nodes.write().await;
        nodes.insert(node.group().to_string(), node);
    }

    pub async fn unregister(&self, group: &str) -> Option<RaftNode> {
        self.nodes.write().await.remove(group)
    }

    pub async fn lookup(&self, group: &str) -> Option<RaftNode> {
        self.nodes.read().await.get(group).cloned()
    }

    pub async fn groups(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Ask every led group to hand off leadership, e.g. ahead of a server
    /// shutdown. Returns whether any transfer was initiated.
    pub async fn transfer_leaders(&self) -> bool {
        let nodes: Vec<RaftNode> = self.nodes.read().await.values().cloned().collect();
        let mut transferred = false;
        for node in nodes {
            if node.is_leader().await && node.step_down().await.is_ok() {
                transferred = true;
            }
        }
        transferred
    }

    /// Step down and stop every registered group.
    pub async fn shutdown_all(&self) {
        let nodes: Vec<RaftNode> = {
            let mut map = self.nodes.write().await;
            map.drain().map(|(_, n)| n).collect()
        };
        for node in nodes {
            if node.is_leader().await {
                let _ = node.step_down().await;
            }
            node.stop().await;
        }
    }
}
