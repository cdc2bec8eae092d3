use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use oxidized_paxos::cluster::LocalCluster;
use oxidized_paxos::communication::Communication;
use oxidized_paxos::config::{load_config, Config};
use oxidized_paxos::logging::init_logging;
use oxidized_paxos::messages::FIELD_MSG;
use oxidized_paxos::node::ConsensusNode;
use oxidized_paxos::transport::{http, HttpTransport};
use oxidized_paxos::types::{NodeId, Value};

#[derive(Debug, Parser)]
#[command(version, about = "Paxos consensus over a fixed cluster membership")]
struct Cli {
    /// YAML configuration; defaults are used when the file does not exist.
    #[arg(long, default_value = "paxos.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one node of the configured cluster over HTTP.
    Node {
        #[arg(long)]
        id: NodeId,
    },
    /// Run a whole cluster in this process and send it some values.
    Simulate {
        #[arg(long)]
        nodes: Option<usize>,

        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        values: Vec<Value>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Node { id } => {
            let _guard = init_logging(&config.logging, &id.to_string());
            run_node(config, id).await
        }
        Command::Simulate { nodes, values } => {
            let _guard = init_logging(&config.logging, "simulation");
            simulate(config, nodes, values).await;
            Ok(())
        }
    }
}

async fn run_node(config: Config, id: NodeId) -> anyhow::Result<()> {
    config.cluster.check_id(id)?;

    let address = config.cluster.address_of(id);
    let listener = TcpListener::bind(address.to_string())
        .await
        .with_context(|| format!("failed to bind node {id} to {address}"))?;

    let transport = HttpTransport::new(config.node.rpc_timeout()).context("failed to build http client")?;
    let node = ConsensusNode::new(
        id,
        config.cluster.identities(),
        Communication::new(transport),
        &config.node,
    )
    .await;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupted, shutting down");
    };
    http::serve(listener, node.clone(), shutdown).await?;

    node.shutdown().await;
    Ok(())
}

async fn simulate(config: Config, nodes: Option<usize>, values: Vec<Value>) {
    let nodes = nodes.unwrap_or(config.cluster.nodes);
    let cluster = LocalCluster::spawn(nodes, &config.node).await;
    let client = cluster.client();

    for value in values {
        let reply = client.send_value(value).await;
        if reply.is_success() {
            println!("{value}: {}", reply.get(FIELD_MSG).unwrap_or_default());
        } else {
            println!("{value}: failed, {}", reply.err().unwrap_or_default());
        }
    }

    for node in cluster.nodes() {
        let log = node.log().committed_log().await;
        println!("node {} committed {:?}", node.id(), log);
    }

    cluster.shutdown().await;
}
