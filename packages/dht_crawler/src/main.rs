//! Smoke-test CLI for the DHT engine: one subcommand per BEP-0005 query,
//! each bootstrapping a node against a known router then driving a single
//! operation and printing what it finds. Generalizes the interactive
//! `python -i -m tinybt.dht` exploration session into four one-shot
//! commands (spec §9 "separate smoke-test commands").

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;

use dht_crawler::{Config, Dht};
use krpc_encoding::NodeId;

#[derive(Parser, Debug)]
#[command(name = "dht_crawler", about = "Mainline DHT engine smoke tests")]
struct Cli {
    /// Local UDP address to bind.
    #[arg(long, default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    /// A known-good bootstrap router, e.g. router.bittorrent.com:6881
    /// resolved to an address ahead of time.
    #[arg(long, default_value = "67.215.246.10:6881")]
    bootstrap: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ping the bootstrap router and print our externally visible endpoint.
    Ping,
    /// Iteratively search for the closest nodes to a random (or given) target.
    FindNode {
        /// Hex-encoded 20-byte target id; random if omitted.
        #[arg(long)]
        target: Option<String>,
    },
    /// Iteratively search for peers on an info-hash.
    GetPeers {
        /// Hex-encoded 20-byte info-hash.
        #[arg(long)]
        info_hash: String,
    },
    /// Announce ourselves on an info-hash to every node that handed us a
    /// get_peers token for it.
    AnnouncePeer {
        #[arg(long)]
        info_hash: String,
        #[arg(long, default_value_t = true)]
        implied_port: bool,
    },
}

fn parse_id(hex: &str) -> Result<NodeId> {
    let bytes = hex::decode(hex).context("target/info_hash must be hex-encoded")?;
    NodeId::try_from_slice(&bytes).context("target/info_hash must decode to 20 bytes")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::default();
    let dht = Dht::new(cli.listen, cli.bootstrap, config)
        .await
        .context("bootstrap failed")?;
    tracing::info!(id = %dht.local_id(), external = %dht.external_endpoint(), "bootstrapped");

    match cli.command {
        Command::Ping => {
            if let Some(reply) = dht.dht_ping(krpc_to_endpoint(cli.bootstrap), Duration::from_secs(5)).await {
                println!("pong from {:?}", reply.id());
            } else {
                println!("ping timed out");
            }
        }
        Command::FindNode { target } => {
            let target = match target {
                Some(hex) => parse_id(&hex)?,
                None => NodeId::random(),
            };
            println!("searching for nodes closest to {target}");
            let mut stream = dht.dht_find_node(target);
            while let Some(endpoint) = stream.next().await {
                println!("found: {endpoint}");
            }
        }
        Command::GetPeers { info_hash } => {
            let info_hash = parse_id(&info_hash)?;
            println!("searching for peers on {info_hash}");
            let mut stream = dht.dht_get_peers(info_hash);
            while let Some(endpoint) = stream.next().await {
                println!("peer: {endpoint}");
            }
        }
        Command::AnnouncePeer { info_hash, implied_port } => {
            let info_hash = parse_id(&info_hash)?;
            // A get_peers pass populates the per-node tokens announce_peer needs.
            let mut stream = dht.dht_get_peers(info_hash);
            while stream.next().await.is_some() {}
            let results = dht.dht_announce_peer(info_hash, implied_port).await;
            for (endpoint, result) in results {
                match result {
                    Ok(_) => println!("announced to {endpoint}"),
                    Err(err) => println!("announce to {endpoint} failed: {err}"),
                }
            }
        }
    }

    dht.shutdown().await;
    Ok(())
}

fn krpc_to_endpoint(addr: SocketAddr) -> krpc_encoding::Endpoint {
    tokio_krpc::to_ipv4_endpoint(addr).unwrap_or(krpc_encoding::Endpoint::new(std::net::Ipv4Addr::UNSPECIFIED, addr.port()))
}
