use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::communication::{Transport, TransportError};
use crate::membership::NodeInfo;
use crate::messages::{Method, Request, RpcReply};
use crate::node::ConsensusNode;
use crate::types::NodeId;

const INBOX_CAPACITY: usize = 128;

/// A request in flight to a local node, with the channel its reply goes back on.
pub struct Envelope {
    pub request: Request,
    pub reply_to: oneshot::Sender<RpcReply>,
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Routes {
    inboxes: BTreeMap<NodeId, mpsc::Sender<Envelope>>,
    disconnected: BTreeSet<NodeId>,
    delays: BTreeMap<NodeId, Duration>,
    drop_probability: f64,
}

/// Routes requests between nodes living in the same process.
///
/// A disconnected node, a node that was never registered and a dropped
/// message all look like a peer that does not answer. So does a node that
/// takes longer than the call timeout to answer a peer request. `SEND_VALUE`
/// is waited for until the round ends, which the node's own peer timeouts bound.
pub struct LocalTransport {
    routes: Mutex<Routes>,
    call_timeout: Duration,
}

impl LocalTransport {
    pub fn new(call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(Routes::default()),
            call_timeout,
        })
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `node` reachable. Each inbound request is accepted on its own task and
    /// handed to the node's worker pool.
    pub fn register(&self, node: Arc<ConsensusNode>) -> JoinHandle<()> {
        let (inbox, mut requests) = mpsc::channel::<Envelope>(INBOX_CAPACITY);
        self.routes().inboxes.insert(node.id(), inbox);

        tokio::spawn(async move {
            while let Some(Envelope { request, reply_to }) = requests.recv().await {
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    let reply = node.dispatch(request).await;
                    let _ = reply_to.send(reply);
                });
            }
            tracing::debug!(id = node.id(), "local inbox closed");
        })
    }

    /// Remove `id` from the routes; its serving task ends once in-flight requests are taken.
    pub fn deregister(&self, id: NodeId) {
        self.routes().inboxes.remove(&id);
    }

    /// Calls to `id` go unanswered until [`LocalTransport::reconnect`].
    pub fn disconnect(&self, id: NodeId) {
        tracing::debug!(id, "disconnecting node");
        self.routes().disconnected.insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        tracing::debug!(id, "reconnecting node");
        self.routes().disconnected.remove(&id);
    }

    /// Requests to `id` take `delay` longer to arrive. Zero removes the delay.
    pub fn set_delay(&self, id: NodeId, delay: Duration) {
        let mut routes = self.routes();
        if delay.is_zero() {
            routes.delays.remove(&id);
        } else {
            routes.delays.insert(id, delay);
        }
    }

    /// Drop each request with the given probability, in `[0, 1]`.
    pub fn set_drop_probability(&self, probability: f64) {
        self.routes().drop_probability = probability.clamp(0.0, 1.0);
    }

    fn route(&self, id: NodeId) -> Option<(mpsc::Sender<Envelope>, Duration)> {
        let routes = self.routes();
        if routes.disconnected.contains(&id) {
            return None;
        }
        if routes.drop_probability > 0.0 && rand::thread_rng().gen_bool(routes.drop_probability) {
            tracing::trace!(id, "dropping message");
            return None;
        }
        let delay = routes.delays.get(&id).copied().unwrap_or_default();
        routes.inboxes.get(&id).cloned().map(|inbox| (inbox, delay))
    }

    async fn deliver(&self, id: NodeId, request: Request) -> Result<RpcReply, TransportError> {
        let (inbox, delay) = self.route(id).ok_or(TransportError::NoResponse(id))?;

        let exchange = async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let (reply_to, reply) = oneshot::channel();
            inbox.send(Envelope { request, reply_to }).await.ok()?;
            reply.await.ok()
        };

        let reply = match request.method() {
            Method::SendValue => exchange.await,
            _ => timeout(self.call_timeout, exchange).await.ok().flatten(),
        };
        reply.ok_or(TransportError::NoResponse(id))
    }
}

impl Transport for LocalTransport {
    fn call<'a>(&'a self, peer: &'a NodeInfo, request: Request) -> BoxFuture<'a, Result<RpcReply, TransportError>> {
        self.deliver(peer.id(), request).boxed()
    }
}

impl Debug for LocalTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let routes = self.routes();
        f.debug_struct("LocalTransport")
            .field("registered", &routes.inboxes.keys().collect::<Vec<_>>())
            .field("disconnected", &routes.disconnected)
            .field("delays", &routes.delays)
            .field("drop_probability", &routes.drop_probability)
            .finish()
    }
}
