use std::collections::BTreeMap;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::future::join_all;

use oxidized_paxos::cluster::LocalCluster;
use oxidized_paxos::config::NodeConfig;
use oxidized_paxos::membership::NodeStatus;
use oxidized_paxos::messages::*;
use oxidized_paxos::types::{Seqnum, Value};

fn config() -> NodeConfig {
    NodeConfig {
        worker_count: 4,
        rpc_timeout_ms: 200,
    }
}

async fn committed_logs(cluster: &LocalCluster) -> Vec<BTreeMap<Seqnum, Value>> {
    let mut logs = Vec::new();
    for node in cluster.nodes() {
        logs.push(node.log().committed_log().await);
    }
    logs
}

#[tokio::test]
async fn value_is_committed_on_every_node() {
    let cluster = LocalCluster::spawn(3, &config()).await;
    let client = cluster.client();

    let reply = client.send_value_to(0, 42).await;

    assert!(reply.is_success(), "{reply:?}");
    assert_eq!(reply.get(FIELD_MSG), Some("Committed Seqnum {0} Value {42}"));
    for log in committed_logs(&cluster).await {
        assert_eq!(log, BTreeMap::from([(0, 42)]));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_costs_the_quorum() {
    let cluster = LocalCluster::spawn(3, &config()).await;
    cluster.transport().disconnect(1);

    let reply = cluster.client().send_value_to(0, 42).await;

    assert_eq!(reply.err(), Some(ERR_NOT_AGREED));
    let node = cluster.node(0).unwrap();
    assert_eq!(node.membership().num_down().await, 1);
    assert_matches!(node.membership().lookup(1).await, Some(info) if info.status == NodeStatus::Down);
    assert!(node.log().committed_log().await.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn previously_accepted_value_wins() {
    let cluster = LocalCluster::spawn(3, &config()).await;
    let acceptor = cluster.node(1).unwrap();
    assert_eq!(acceptor.log().accept(5, 99).await, AcceptReply::Accepted);

    let reply = cluster.client().send_value_to(0, 42).await;

    assert!(reply.is_success(), "{reply:?}");
    assert_eq!(reply.get(FIELD_SEQNUM), Some("5"));
    assert_eq!(reply.get(FIELD_VALUE), Some("99"));
    for log in committed_logs(&cluster).await {
        assert_eq!(log, BTreeMap::from([(5, 99)]));
    }
    assert_eq!(acceptor.log().snapshot().await.accepted, None);

    // the next round starts above the committed seqnum
    let reply = cluster.client().send_value_to(0, 7).await;
    assert_eq!(reply.get(FIELD_SEQNUM), Some("6"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn five_nodes_tolerate_two_failures_but_not_three() {
    let cluster = LocalCluster::spawn(5, &config()).await;
    let client = cluster.client();

    cluster.transport().disconnect(4);
    assert!(client.send_value_to(0, 1).await.is_success());

    cluster.transport().disconnect(3);
    let reply = client.send_value_to(0, 2).await;
    assert!(!reply.is_success());
    assert_eq!(reply.err(), Some(ERR_NOT_AGREED));

    // node 2 still holds the promise of the failed round, the other three are exactly a quorum
    cluster.transport().reconnect(3);
    cluster.transport().reconnect(4);
    assert!(client.send_value_to(1, 3).await.is_success());

    cluster.shutdown().await;
}

#[tokio::test]
async fn sequential_values_fill_the_log_in_order() {
    let cluster = LocalCluster::spawn(3, &config()).await;
    let client = cluster.client();

    for value in [10, 20, 30] {
        let reply = client.send_value(value).await;
        assert!(reply.is_success(), "{reply:?}");
    }

    let expected = BTreeMap::from([(0, 10), (1, 20), (2, 30)]);
    for log in committed_logs(&cluster).await {
        assert_eq!(log, expected);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn too_many_down_peers_refuse_client_requests() {
    let cluster = LocalCluster::spawn(5, &config()).await;
    let node = cluster.node(0).unwrap();
    for id in [1, 2, 3, 4] {
        node.membership().mark_down(id).await;
    }

    let reply = cluster.client().send_value_to(0, 1).await;
    assert_eq!(reply.err(), Some(ERR_TOO_FEW_NODES));

    cluster.shutdown().await;
}

#[tokio::test]
async fn dropped_messages_fail_rounds_without_breaking_the_cluster() {
    let cluster = LocalCluster::spawn(3, &config()).await;
    let client = cluster.client();

    cluster.transport().set_drop_probability(1.0);
    // the client's own request is dropped too
    assert!(client.send_value_to(0, 1).await.is_no_response());

    cluster.transport().set_drop_probability(0.0);
    let reply = client.send_value_to(2, 2).await;
    assert!(reply.is_success(), "{reply:?}");
    assert_eq!(reply.get(FIELD_SEQNUM), Some("2"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn client_waits_for_a_round_slowed_by_a_peer() {
    let cluster = LocalCluster::spawn(3, &config()).await;
    // each phase takes longer than one peer timeout once the delays add up
    cluster.transport().set_delay(2, Duration::from_millis(100));

    let reply = cluster.client().send_value_to(0, 42).await;

    assert!(reply.is_success(), "{reply:?}");
    for log in committed_logs(&cluster).await {
        assert_eq!(log, BTreeMap::from([(0, 42)]));
    }
    assert_eq!(cluster.node(0).unwrap().membership().num_down().await, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn contending_proposers_answer_and_never_disagree() {
    let cluster = LocalCluster::spawn(3, &config()).await;
    let client = cluster.client();

    let replies = join_all((0..3).map(|id| client.send_value_to(id, 100 + id as Value))).await;
    for reply in &replies {
        assert!(
            reply.is_success() || matches!(reply.err(), Some(ERR_NOT_AGREED | ERR_NOT_ACCEPTED)),
            "{reply:?}"
        );
    }

    // once the contention is over a single proposer gets through
    let reply = client.send_value_to(0, 7).await;
    assert!(reply.is_success(), "{reply:?}");

    let logs = committed_logs(&cluster).await;
    assert!(logs.iter().all(|log| !log.is_empty()));
    for (i, log) in logs.iter().enumerate() {
        for other in &logs[i + 1..] {
            for (seqnum, value) in log {
                if let Some(other_value) = other.get(seqnum) {
                    assert_eq!(value, other_value, "nodes disagree at seqnum {seqnum}");
                }
            }
        }
    }

    cluster.shutdown().await;
}
