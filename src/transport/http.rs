use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::TcpListener;

use crate::communication::{Transport, TransportError};
use crate::membership::NodeInfo;
use crate::messages::*;
use crate::node::ConsensusNode;

/// HTTP status a reply is sent with. Protocol level failures such as a value
/// that was not agreed upon are still a successful exchange.
pub fn status_code(reply: &RpcReply) -> StatusCode {
    if reply.is_success() {
        return StatusCode::OK;
    }
    match reply.err() {
        Some(ERR_METHOD_NOT_FOUND) => StatusCode::NOT_FOUND,
        Some(ERR_MALFORMED) => StatusCode::BAD_REQUEST,
        Some(ERR_INTERNAL) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    }
}

fn render(reply: RpcReply) -> Response {
    (status_code(&reply), Json(reply)).into_response()
}

/// Routes `GET /api/<method>?key=value&...` to `node`.
pub fn router(node: Arc<ConsensusNode>) -> Router {
    Router::new()
        .route("/api/:method", get(handle_api))
        .fallback(|| async { render(RpcReply::failure(ERR_METHOD_NOT_FOUND)) })
        .with_state(node)
}

async fn handle_api(
    State(node): State<Arc<ConsensusNode>>,
    Path(method): Path<String>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Response {
    let params = match query {
        Ok(Query(params)) => params,
        Err(rejection) => return malformed_query(rejection),
    };
    tracing::debug!(%method, ?params, "request");
    render(node.serve(&method, &params).await)
}

fn malformed_query(rejection: QueryRejection) -> Response {
    tracing::debug!("undecodable query string: {rejection}");
    render(RpcReply::failure(ERR_MALFORMED).with(FIELD_MSG, rejection.body_text()))
}

/// Serve `node` on `listener` until `shutdown` resolves.
pub async fn serve<S>(listener: TcpListener, node: Arc<ConsensusNode>, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let address = listener.local_addr()?;
    tracing::info!(id = node.id(), %address, "listening");
    axum::serve(listener, router(node)).with_graceful_shutdown(shutdown).await
}

/// Calls peers over HTTP. Connection failures and timeouts are reported as no response.
///
/// Peer requests time out after `request_timeout`. A `SEND_VALUE` only has the
/// connect timeout: its reply comes when the round ends.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Arc<Self>, reqwest::Error> {
        let client = reqwest::Client::builder().connect_timeout(request_timeout).build()?;
        Ok(Arc::new(Self { client, request_timeout }))
    }

    pub fn url(peer: &NodeInfo, method: Method) -> String {
        format!("http://{}/api/{}", peer.address(), method.as_str().to_ascii_lowercase())
    }

    async fn get(&self, peer: &NodeInfo, request: Request) -> Result<RpcReply, TransportError> {
        let mut builder = self
            .client
            .get(Self::url(peer, request.method()))
            .query(&request.params());
        if request.method() != Method::SendValue {
            builder = builder.timeout(self.request_timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| {
                tracing::trace!(peer = peer.id(), "request failed: {e}");
                TransportError::NoResponse(peer.id())
            })?;

        response
            .json::<RpcReply>()
            .await
            .map_err(|e| TransportError::MalformedReply {
                node: peer.id(),
                reason: e.to_string(),
            })
    }
}

impl Transport for HttpTransport {
    fn call<'a>(&'a self, peer: &'a NodeInfo, request: Request) -> BoxFuture<'a, Result<RpcReply, TransportError>> {
        self.get(peer, request).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{NodeAddress, NodeIdentity, NodeStatus};

    #[test]
    fn status_codes_follow_the_error_kind() {
        assert_eq!(status_code(&RpcReply::ok()), StatusCode::OK);
        assert_eq!(status_code(&RpcReply::failure(ERR_NOT_AGREED)), StatusCode::OK);
        assert_eq!(status_code(&RpcReply::failure(ERR_METHOD_NOT_FOUND)), StatusCode::NOT_FOUND);
        assert_eq!(status_code(&RpcReply::failure(ERR_MALFORMED)), StatusCode::BAD_REQUEST);
        assert_eq!(status_code(&RpcReply::failure(ERR_INTERNAL)), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn undecodable_queries_get_a_json_bad_request() {
        let uri = "/api/commit?seqnum=one".parse().unwrap();
        let rejection = Query::<Vec<(String, u64)>>::try_from_uri(&uri).unwrap_err();

        let response = malformed_query(rejection);

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[test]
    fn urls_use_lowercase_method_names() {
        let peer = NodeInfo {
            identity: NodeIdentity::new(2, NodeAddress::new("127.0.0.1", 8002)),
            status: NodeStatus::Up,
        };
        assert_eq!(
            HttpTransport::url(&peer, Method::ProposeSeqnum),
            "http://127.0.0.1:8002/api/propose_seqnum"
        );
    }

    #[tokio::test]
    async fn unreachable_peer_gives_no_response() {
        // bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let peer = NodeInfo {
            identity: NodeIdentity::new(1, NodeAddress::new("127.0.0.1", port)),
            status: NodeStatus::Up,
        };
        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();

        let result = transport.call(&peer, Request::ProposeSeqnum { seqnum: 1 }).await;
        assert_eq!(result, Err(TransportError::NoResponse(1)));
    }
}
