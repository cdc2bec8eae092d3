use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use oxidized_paxos::client::Client;
use oxidized_paxos::communication::Communication;
use oxidized_paxos::config::NodeConfig;
use oxidized_paxos::membership::{NodeAddress, NodeIdentity};
use oxidized_paxos::messages::*;
use oxidized_paxos::node::ConsensusNode;
use oxidized_paxos::transport::{http, HttpTransport};

struct Served {
    node: Arc<ConsensusNode>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

async fn serve_cluster(n: u32) -> (Vec<Served>, Vec<NodeIdentity>) {
    let config = NodeConfig {
        worker_count: 4,
        rpc_timeout_ms: 500,
    };

    let mut listeners = Vec::new();
    let mut identities = Vec::new();
    for id in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        identities.push(NodeIdentity::new(id, NodeAddress::new("127.0.0.1", port)));
        listeners.push(listener);
    }

    let mut served = Vec::new();
    for (id, listener) in (0..n).zip(listeners) {
        let transport = HttpTransport::new(config.rpc_timeout()).unwrap();
        let node = ConsensusNode::new(id, identities.clone(), Communication::new(transport), &config).await;
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(http::serve(listener, node.clone(), async move {
            let _ = stopped.await;
        }));
        served.push(Served { node, stop, handle });
    }
    (served, identities)
}

async fn stop_cluster(served: Vec<Served>) {
    for Served { node, stop, handle } in served {
        let _ = stop.send(());
        handle.await.unwrap().unwrap();
        node.shutdown().await;
    }
}

#[tokio::test]
async fn round_over_http() {
    let (served, identities) = serve_cluster(3).await;
    let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
    let client = Client::new(Communication::new(transport), identities);

    let reply = client.send_value_to(0, 42).await;

    assert!(reply.is_success(), "{reply:?}");
    assert_eq!(reply.get(FIELD_SEQNUM), Some("0"));
    assert_eq!(reply.get(FIELD_VALUE), Some("42"));
    for Served { node, .. } in &served {
        assert_eq!(node.log().committed_value(0).await, Some(42));
    }

    stop_cluster(served).await;
}

#[tokio::test]
async fn bad_requests_get_error_statuses() {
    let (served, identities) = serve_cluster(3).await;
    let base = format!("http://{}", identities[0].address);
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/api/get_value")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let reply: RpcReply = response.json().await.unwrap();
    assert_eq!(reply.err(), Some(ERR_METHOD_NOT_FOUND));

    let response = client
        .get(format!("{base}/api/commit?seqnum=one&value=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let reply: RpcReply = response.json().await.unwrap();
    assert_eq!(reply.err(), Some(ERR_MALFORMED));

    let response = client
        .get(format!("{base}/api/commit?seqnum=%ZZ&value=%FF"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let reply: RpcReply = response.json().await.unwrap();
    assert_eq!(reply.err(), Some(ERR_MALFORMED));

    let response = client
        .get(format!("{base}/api/propose_seqnum?seqnum=3"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let reply: RpcReply = response.json().await.unwrap();
    assert_eq!(PromiseReply::from_reply(&reply), Some(PromiseReply::Agree { accepted: None }));

    stop_cluster(served).await;
}
