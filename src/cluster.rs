use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::client::Client;
use crate::communication::Communication;
use crate::config::{ClusterConfig, NodeConfig};
use crate::membership::NodeIdentity;
use crate::node::ConsensusNode;
use crate::transport::LocalTransport;
use crate::types::NodeId;

/// `n` nodes with ids `0..n` talking over a [`LocalTransport`].
pub struct LocalCluster {
    transport: Arc<LocalTransport>,
    identities: Vec<NodeIdentity>,
    nodes: Vec<Arc<ConsensusNode>>,
    handles: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Start the nodes and make them reachable. Every node knows the full
    /// membership before any of them takes a request.
    pub async fn spawn(n: usize, config: &NodeConfig) -> Self {
        let transport = LocalTransport::new(config.rpc_timeout());
        let identities = ClusterConfig {
            nodes: n,
            ..Default::default()
        }
        .identities();

        let mut nodes = Vec::with_capacity(n);
        for identity in &identities {
            let communication = Communication::new(transport.clone());
            nodes.push(ConsensusNode::new(identity.id, identities.clone(), communication, config).await);
        }

        let handles = nodes.iter().map(|node| transport.register(Arc::clone(node))).collect();
        tracing::info!(n, "local cluster started");

        Self {
            transport,
            identities,
            nodes,
            handles,
        }
    }

    pub fn nodes(&self) -> &[Arc<ConsensusNode>] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<ConsensusNode>> {
        self.nodes.get(id as usize)
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// A client that knows every node of the cluster.
    pub fn client(&self) -> Client {
        Client::new(Communication::new(self.transport.clone()), self.identities.clone())
    }

    /// Unregister every node and wait for their queued requests to finish.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            self.transport.deregister(node.id());
        }
        for node in &self.nodes {
            node.shutdown().await;
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("local cluster stopped");
    }
}
