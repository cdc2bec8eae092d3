use std::fmt::{self, Display, Formatter};

use itertools::Itertools;

use crate::lock::QuorumLock;
use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Who a node is and where to reach it. Never changes once the membership is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub address: NodeAddress,
}

impl NodeIdentity {
    pub fn new(id: NodeId, address: NodeAddress) -> Self {
        Self { id, address }
    }
}

/// Liveness as observed locally by this node; not shared with other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub identity: NodeIdentity,
    pub status: NodeStatus,
}

impl NodeInfo {
    pub fn id(&self) -> NodeId {
        self.identity.id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.identity.address
    }

    pub fn is_up(&self) -> bool {
        self.status == NodeStatus::Up
    }
}

impl Display for NodeInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({:?})", self.identity.id, self.identity.address, self.status)
    }
}

#[derive(Debug, Default)]
struct MembershipState {
    nodes: Vec<NodeInfo>,
    quorum_size: Option<usize>,
    num_down: usize,
}

impl MembershipState {
    fn is_sealed(&self) -> bool {
        self.quorum_size.is_some()
    }
}

/// The fixed set of nodes taking part in consensus, as seen by one node.
///
/// Nodes are added while the membership is open; [`Membership::seal`] freezes the
/// topology and the quorum size. Afterwards only liveness can change.
#[derive(Debug)]
pub struct Membership {
    self_id: NodeId,
    state: QuorumLock<MembershipState>,
}

impl Membership {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            state: QuorumLock::new("membership", MembershipState::default()),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Add a node. Ignored once the membership is sealed.
    pub async fn add_node(&self, identity: NodeIdentity, status: NodeStatus) {
        let mut state = self.state.write().await;
        if state.is_sealed() {
            tracing::warn!(id = identity.id, "membership is sealed, not adding node");
            return;
        }
        state.nodes.push(NodeInfo { identity, status });
    }

    /// Add every node of `batch` that is not already present. Ignored once sealed.
    pub async fn set_nodes(&self, batch: impl IntoIterator<Item = NodeInfo>) {
        let mut state = self.state.write().await;
        if state.is_sealed() {
            tracing::warn!("membership is sealed, not adding nodes");
            return;
        }
        for node in batch {
            if !state.nodes.contains(&node) {
                state.nodes.push(node);
            }
        }
    }

    /// Freeze the topology and compute the quorum size `floor(N/2) + 1`.
    /// Sealing twice keeps the first quorum.
    pub async fn seal(&self) {
        let mut state = self.state.write().await;
        if state.is_sealed() {
            return;
        }
        let quorum = state.nodes.len() / 2 + 1;
        state.quorum_size = Some(quorum);
        tracing::debug!(
            quorum,
            "membership sealed: [{}]",
            state.nodes.iter().map(|node| node.id()).join(", ")
        );
    }

    pub async fn is_sealed(&self) -> bool {
        self.state.read().await.is_sealed()
    }

    /// `None` until the membership is sealed.
    pub async fn quorum_size(&self) -> Option<usize> {
        self.state.read().await.quorum_size
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.nodes.is_empty()
    }

    pub async fn snapshot_nodes(&self) -> Vec<NodeInfo> {
        self.state.read().await.nodes.clone()
    }

    /// Every node except this one.
    pub async fn peers(&self) -> Vec<NodeInfo> {
        self.state
            .read()
            .await
            .nodes
            .iter()
            .filter(|node| node.id() != self.self_id)
            .cloned()
            .collect()
    }

    pub async fn lookup(&self, id: NodeId) -> Option<NodeInfo> {
        self.state.read().await.nodes.iter().find(|node| node.id() == id).cloned()
    }

    /// Record that `id` failed to answer an RPC. A node is counted once, the first
    /// time it is seen down; it stays down until this node restarts.
    pub async fn mark_down(&self, id: NodeId) {
        let mut state = self.state.write().await;
        let Some(node) = state.nodes.iter_mut().find(|node| node.id() == id) else {
            tracing::warn!(id, "cannot mark unknown node as down");
            return;
        };
        if node.status == NodeStatus::Down {
            return;
        }
        node.status = NodeStatus::Down;
        state.num_down += 1;
        tracing::info!(id, num_down = state.num_down, "peer marked down");
    }

    pub async fn num_down(&self) -> usize {
        self.state.read().await.num_down
    }
}
