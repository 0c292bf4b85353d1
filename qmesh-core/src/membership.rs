//! Where a query may run: candidate destinations per partition.

use std::collections::HashMap;
use std::net::SocketAddrV4;

/// Cluster membership as seen by one node.
pub trait Membership: Send + Sync {
    /// Nodes that may execute a query pinned to `node_id`, or any capable node for `None`.
    fn candidates(&self, node_id: Option<i64>) -> Vec<SocketAddrV4>;
}

/// Fixed partition-to-replica table.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    replicas: HashMap<i64, Vec<SocketAddrV4>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replicas(mut self, node_id: i64, hosts: Vec<SocketAddrV4>) -> Self {
        self.replicas.insert(node_id, hosts);
        self
    }

    /// Every known host, each once, in a stable order.
    pub fn hosts(&self) -> Vec<SocketAddrV4> {
        let mut all: Vec<SocketAddrV4> = self.replicas.values().flatten().copied().collect();
        all.sort();
        all.dedup();
        all
    }
}

impl Membership for StaticMembership {
    fn candidates(&self, node_id: Option<i64>) -> Vec<SocketAddrV4> {
        match node_id {
            Some(id) => self.replicas.get(&id).cloned().unwrap_or_default(),
            None => self.hosts(),
        }
    }
}
