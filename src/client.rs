use std::sync::atomic::{AtomicUsize, Ordering};

use crate::communication::Communication;
use crate::membership::{NodeIdentity, NodeInfo, NodeStatus};
use crate::messages::{Request, RpcReply, ERR_INVALID_ID, ERR_NODE_NOT_FOUND};
use crate::types::{NodeId, Value};

/// Sends values to the cluster. Any node can drive a round, so requests go
/// round-robin and a failed round is retried once on the next node.
#[derive(Debug)]
pub struct Client {
    communication: Communication,
    nodes: Vec<NodeInfo>,
    next: AtomicUsize,
}

impl Client {
    pub fn new(communication: Communication, nodes: impl IntoIterator<Item = NodeIdentity>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|identity| NodeInfo {
                identity,
                status: NodeStatus::Up,
            })
            .collect();
        Self {
            communication,
            nodes,
            next: AtomicUsize::new(0),
        }
    }

    /// Send `value` to the next node in turn, moving on to the following one
    /// if that round fails.
    pub async fn send_value(&self, value: Value) -> RpcReply {
        let mut reply = RpcReply::failure(ERR_NODE_NOT_FOUND);
        for _ in 0..self.nodes.len().min(2) {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
            let node = &self.nodes[index];

            reply = self.communication.send(node, Request::SendValue { value }).await;
            if reply.is_success() {
                break;
            }
            tracing::debug!(node = node.id(), value, "round failed: {:?}", reply.err());
        }
        reply
    }

    /// Send `value` to node `id` only.
    pub async fn send_value_to(&self, id: NodeId, value: Value) -> RpcReply {
        if id as usize >= self.nodes.len() {
            return RpcReply::failure(ERR_INVALID_ID);
        }
        let Some(node) = self.nodes.iter().find(|node| node.id() == id) else {
            return RpcReply::failure(ERR_NODE_NOT_FOUND);
        };

        self.communication.send(node, Request::SendValue { value }).await
    }
}
