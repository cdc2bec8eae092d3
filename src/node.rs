use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info_span, Instrument, Span};

use crate::acceptor_log::AcceptorLog;
use crate::communication::Communication;
use crate::config::NodeConfig;
use crate::lock::QuorumLock;
use crate::membership::{Membership, NodeIdentity, NodeInfo, NodeStatus};
use crate::messages::*;
use crate::types::{NodeId, Seqnum, Value};
use crate::work_queue::WorkQueue;

/// Why a consensus round driven by this node did not commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoundError {
    #[error("{}", ERR_NOT_AGREED)]
    NotAgreed,
    #[error("{}", ERR_NOT_ACCEPTED)]
    NotAccepted,
    #[error("{}", ERR_TOO_FEW_NODES)]
    TooFewNodes,
    /// The committed high-water mark leaves this node no seqnum to propose with.
    #[error("{}", ERR_SEQNUMS_EXHAUSTED)]
    SeqnumsExhausted,
}

/// A value decided by a successful round. It may differ from the value the
/// client asked for when an acceptor had already accepted another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub seqnum: Seqnum,
    pub value: Value,
}

impl From<Result<Committed, RoundError>> for RpcReply {
    fn from(outcome: Result<Committed, RoundError>) -> Self {
        match outcome {
            Ok(Committed { seqnum, value }) => RpcReply::ok()
                .with(FIELD_MSG, format_args!("Committed Seqnum {{{seqnum}}} Value {{{value}}}"))
                .with(FIELD_SEQNUM, seqnum)
                .with(FIELD_VALUE, value),
            Err(e) => RpcReply::failure(e),
        }
    }
}

/// One Paxos participant: acceptor for its peers' proposals and proposer for
/// the values its clients send.
///
/// Requests may arrive concurrently but are handled one at a time, end to end:
/// a client round holds the node lock until its commit phase is done.
pub struct ConsensusNode {
    id: NodeId,
    log: AcceptorLog,
    membership: Membership,
    communication: Communication,
    work_queue: WorkQueue,
    serial: QuorumLock<()>,
    span: Span,
}

impl ConsensusNode {
    /// Build a node whose membership is exactly `nodes`, sealed before returning.
    /// Must be called from within a tokio runtime, the worker pool is spawned here.
    pub async fn new(
        id: NodeId,
        nodes: Vec<NodeIdentity>,
        communication: Communication,
        config: &NodeConfig,
    ) -> Arc<Self> {
        let span = info_span!("node", id);

        let membership = Membership::new(id);
        membership
            .set_nodes(nodes.into_iter().map(|identity| NodeInfo {
                identity,
                status: NodeStatus::Up,
            }))
            .await;
        membership.seal().await;
        let num_nodes = membership.len().await;

        let node = Arc::new(Self {
            id,
            log: AcceptorLog::new(id, num_nodes),
            membership,
            communication,
            work_queue: WorkQueue::new(config.worker_count, span.clone()),
            serial: QuorumLock::new("node", ()),
            span,
        });
        tracing::info!(parent: &node.span, num_nodes, "node started");
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn log(&self) -> &AcceptorLog {
        &self.log
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Entry point for transports: decode a wire request and serve it.
    pub async fn serve<K, V>(self: &Arc<Self>, method: &str, params: &[(K, V)]) -> RpcReply
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        match Request::parse(method, params) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                tracing::debug!(parent: &self.span, "bad request: {e}");
                e.to_reply()
            }
        }
    }

    /// Queue `request` on the worker pool and wait for its reply.
    pub async fn dispatch(self: &Arc<Self>, request: Request) -> RpcReply {
        let (reply_to, reply) = oneshot::channel();
        let node = Arc::clone(self);
        let job = async move {
            let result = node.handle(request).await;
            // the requester may have given up waiting
            let _ = reply_to.send(result);
            Ok::<_, anyhow::Error>(())
        };

        if let Err(e) = self.work_queue.submit(job.instrument(self.span.clone())) {
            tracing::warn!(parent: &self.span, "dropping {}: {e}", request.method());
            return RpcReply::failure(ERR_SHUTTING_DOWN);
        }

        match reply.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(parent: &self.span, "{} handler failed without replying", request.method());
                RpcReply::failure(ERR_INTERNAL)
            }
        }
    }

    /// Serve one request while holding the node lock.
    pub async fn handle(&self, request: Request) -> RpcReply {
        let _serial = self.serial.write().await;
        tracing::debug!(?request, "handling");

        match request {
            Request::SendValue { value } => self.on_send_value(value).await.into(),
            Request::ProposeSeqnum { seqnum } => self.log.promise(seqnum).await.into(),
            Request::AcceptValue { seqnum, value } => self.log.accept(seqnum, value).await.into(),
            Request::Commit { seqnum, value } => {
                self.log.commit(seqnum, value).await;
                RpcReply::ok()
            }
        }
    }

    async fn on_send_value(&self, value: Value) -> Result<Committed, RoundError> {
        self.admit_client_request().await?;

        let seqnum = self
            .log
            .generate_next_seqnum()
            .await
            .ok_or(RoundError::SeqnumsExhausted)?;
        tracing::info!(value, seqnum, "starting consensus round");

        let outcome = self.run_round(seqnum, value).await;
        match &outcome {
            Ok(committed) => tracing::info!(?committed, "round committed"),
            Err(e) => tracing::info!("round failed: {e}"),
        }
        outcome
    }

    /// Refuse client work once more peers are known down than a quorum.
    async fn admit_client_request(&self) -> Result<(), RoundError> {
        let num_down = self.membership.num_down().await;
        let quorum = self.quorum().await;
        if num_down > quorum {
            tracing::warn!(num_down, quorum, "too few nodes reachable, refusing client request");
            return Err(RoundError::TooFewNodes);
        }
        Ok(())
    }

    /// Propose, accept, then commit.
    async fn run_round(&self, seqnum: Seqnum, value: Value) -> Result<Committed, RoundError> {
        let (seqnum, value) = self.propose_phase(seqnum, value).await?;
        self.accept_phase(seqnum, value).await?;
        self.commit_phase(seqnum, value).await;
        Ok(Committed { seqnum, value })
    }

    /// Ask peers to promise `seqnum`. Returns the pair to run the accept phase
    /// with: the highest numbered value a peer already accepted, or the input.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn propose_phase(&self, seqnum: Seqnum, value: Value) -> Result<(Seqnum, Value), RoundError> {
        let quorum = self.quorum().await;
        let mut agrees = 0;
        let mut adopted: Option<(Seqnum, Value)> = None;

        for peer in self.membership.peers().await {
            let reply = self.call_peer(&peer, Request::ProposeSeqnum { seqnum }).await;

            match PromiseReply::from_reply(&reply) {
                Some(PromiseReply::Agree { accepted }) => {
                    agrees += 1;
                    if let Some(pair) = accepted {
                        if adopted.map_or(true, |(highest, _)| pair.0 > highest) {
                            adopted = Some(pair);
                        }
                    }
                }
                Some(PromiseReply::Rejected) => tracing::trace!(peer = peer.id(), "promise rejected"),
                None => tracing::trace!(peer = peer.id(), ?reply, "no promise"),
            }

            if agrees >= quorum {
                if let Some(pair) = adopted {
                    tracing::debug!(?pair, "adopting previously accepted value");
                }
                return Ok(adopted.unwrap_or((seqnum, value)));
            }
        }

        tracing::debug!(agrees, quorum, "promise quorum not reached");
        Err(RoundError::NotAgreed)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn accept_phase(&self, seqnum: Seqnum, value: Value) -> Result<(), RoundError> {
        let quorum = self.quorum().await;
        let mut accepts = 0;

        for peer in self.membership.peers().await {
            let reply = self.call_peer(&peer, Request::AcceptValue { seqnum, value }).await;

            if AcceptReply::from_reply(&reply) == Some(AcceptReply::Accepted) {
                accepts += 1;
            }
            if accepts >= quorum {
                return Ok(());
            }
        }

        tracing::debug!(accepts, quorum, "accept quorum not reached");
        Err(RoundError::NotAccepted)
    }

    /// Record the decision locally and tell every peer. Peers that miss the
    /// commit learn the value again through a later promise exchange.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn commit_phase(&self, seqnum: Seqnum, value: Value) {
        self.log.commit(seqnum, value).await;

        let peers = self.membership.peers().await;
        let replies = join_all(
            peers
                .iter()
                .map(|peer| self.call_peer(peer, Request::Commit { seqnum, value })),
        )
        .await;

        let missed = replies.iter().filter(|reply| !reply.is_success()).count();
        if missed > 0 {
            tracing::debug!(missed, "commit not acknowledged by every peer");
        }
    }

    async fn call_peer(&self, peer: &NodeInfo, request: Request) -> RpcReply {
        let reply = self.communication.send(peer, request).await;
        if reply.is_no_response() {
            self.membership.mark_down(peer.id()).await;
        }
        reply
    }

    async fn quorum(&self) -> usize {
        // sealed in the constructor
        self.membership.quorum_size().await.unwrap_or(usize::MAX)
    }

    /// Stop taking requests and wait for queued ones to finish.
    pub async fn shutdown(&self) {
        self.work_queue.shutdown();
        self.work_queue.await_termination().await;
        tracing::info!(parent: &self.span, "node shut down");
    }
}

impl Debug for ConsensusNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusNode")
            .field("id", &self.id)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}
