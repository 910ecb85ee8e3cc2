//! Murmur CLI - in-process cluster simulator for the gossip replication
//! engine.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use murmur_core::config::GossipConfig;
use murmur_core::coordinator::Coordinator;
use murmur_core::transport::{InMemoryNetwork, SharedTransport};
use serde_json::json;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Murmur gossip replication simulator
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process simulated cluster, broadcast from node 0, and
    /// report convergence and per-node metrics
    Sim {
        /// Number of simulated nodes
        #[arg(short, long, default_value = "10")]
        nodes: usize,

        /// Push/pull fanout per gossip round
        #[arg(long, default_value = "3")]
        fanout: usize,

        /// Gossip round cadence
        #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
        gossip_interval: Duration,

        /// Fraction of nodes a message must reach to count as converged
        #[arg(long, default_value = "0.95")]
        convergence_threshold: f64,

        /// Give up if the cluster has not converged after this long
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Sim {
            nodes,
            fanout,
            gossip_interval,
            convergence_threshold,
            timeout,
        } => {
            run_sim(
                nodes,
                fanout,
                gossip_interval,
                convergence_threshold,
                timeout,
            )
            .await
        }
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let level = log_level
        .parse::<Level>()
        .with_context(|| format!("invalid log level '{log_level}'"))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;
    Ok(())
}

fn sim_addr(idx: usize) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9_000 + idx as u16)
}

fn node_id(idx: usize) -> String {
    format!("node-{idx}")
}

async fn run_sim(
    nodes: usize,
    fanout: usize,
    gossip_interval: Duration,
    convergence_threshold: f64,
    timeout: Duration,
) -> Result<()> {
    if nodes < 2 {
        bail!("a simulated cluster needs at least 2 nodes");
    }

    let network = InMemoryNetwork::new();
    let mut cluster = Vec::with_capacity(nodes);
    let mut inboxes = Vec::with_capacity(nodes);
    for idx in 0..nodes {
        let config = GossipConfig {
            node_id: node_id(idx),
            push_fanout: fanout,
            pull_fanout: fanout,
            gossip_interval,
            convergence_threshold,
            ..GossipConfig::default()
        };
        let registration = network.register(node_id(idx));
        let transport: SharedTransport = registration.transport.clone();
        let coordinator = Coordinator::new(config, transport)
            .with_context(|| format!("failed to construct node {idx}"))?;
        cluster.push(Arc::new(coordinator));
        inboxes.push(registration.inbox);
    }

    for (idx, coordinator) in cluster.iter().enumerate() {
        coordinator
            .start()
            .with_context(|| format!("failed to start node {idx}"))?;
        for peer in 0..nodes {
            if peer != idx {
                coordinator.add_peer(node_id(peer), sim_addr(peer));
            }
        }
    }
    for (coordinator, inbox) in cluster.iter().zip(inboxes) {
        coordinator
            .attach_inbox(inbox)
            .context("failed to attach simulated inbox")?;
    }
    info!(nodes, fanout, "simulated cluster running");

    let started = Instant::now();
    cluster[0]
        .broadcast(json!({"text": "simulated broadcast", "from": node_id(0)}))
        .await
        .context("broadcast from node 0 failed")?;

    let deadline = started + timeout;
    let (reached, elapsed) = loop {
        let reached = cluster
            .iter()
            .filter(|coordinator| coordinator.metrics().dissemination.stored >= 1)
            .count();
        if reached as f64 / nodes as f64 >= convergence_threshold {
            break (reached, started.elapsed());
        }
        if Instant::now() > deadline {
            bail!("cluster failed to converge: {reached}/{nodes} nodes reached");
        }
        tokio::time::sleep(gossip_interval / 2).await;
    };

    let rounds = elapsed.as_secs_f64() / gossip_interval.as_secs_f64();
    println!(
        "converged: {reached}/{nodes} nodes in {elapsed:.2?} (~{rounds:.1} gossip rounds)"
    );

    let origin_metrics = cluster[0].metrics();
    println!(
        "node-0 metrics: {}",
        serde_json::to_string_pretty(&origin_metrics)?
    );
    let totals: u64 = cluster
        .iter()
        .map(|coordinator| coordinator.metrics().dissemination.rumors_sent)
        .sum();
    println!("cluster-wide rumors sent: {totals}");

    for coordinator in &cluster {
        coordinator
            .stop()
            .await
            .context("failed to stop simulated node")?;
    }
    info!("simulated cluster stopped");
    Ok(())
}
