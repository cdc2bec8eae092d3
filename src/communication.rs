use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::config::MAX_SEND_ATTEMPTS;
use crate::membership::NodeInfo;
use crate::messages::{Method, Request, RpcReply, ERR_NO_RESPONSE};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer is unreachable or did not answer in time. The only retried error.
    #[error("no response from node {0}")]
    NoResponse(u32),
    /// The peer answered with something that is not a reply.
    #[error("malformed reply from node {node}: {reason}")]
    MalformedReply { node: u32, reason: String },
}

/// Delivers one request to one peer and returns its reply.
pub trait Transport: Send + Sync + 'static {
    fn call<'a>(&'a self, peer: &'a NodeInfo, request: Request) -> BoxFuture<'a, Result<RpcReply, TransportError>>;
}

/// Outbound RPCs with a bounded retry when a peer gives no response.
#[derive(Clone)]
pub struct Communication {
    transport: Arc<dyn Transport>,
}

impl Communication {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send `request` to `peer`. Only a missing response is retried, up to
    /// [`MAX_SEND_ATTEMPTS`] attempts in total; any answer, including a protocol
    /// rejection, is returned as is. Running out of attempts yields a failed
    /// reply with the `"No response"` error.
    ///
    /// `SEND_VALUE` is attempted once: the round it started may still be running.
    #[tracing::instrument(level = "trace", skip(self, peer), fields(peer = peer.id()))]
    pub async fn send(&self, peer: &NodeInfo, request: Request) -> RpcReply {
        let attempts = match request.method() {
            Method::SendValue => 1,
            _ => MAX_SEND_ATTEMPTS,
        };

        for attempt in 1..=attempts {
            match self.transport.call(peer, request).await {
                Ok(reply) => {
                    tracing::trace!(?reply);
                    return reply;
                }
                Err(TransportError::NoResponse(_)) => {
                    tracing::debug!(attempt, "no response from {}", peer.address());
                }
                Err(e) => {
                    tracing::warn!("{e}");
                    return RpcReply::failure(e);
                }
            }
        }

        RpcReply::failure(ERR_NO_RESPONSE)
    }
}

impl Debug for Communication {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communication").finish_non_exhaustive()
    }
}
