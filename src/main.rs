use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use trellis::id::debug_id;
use trellis::{Config, Credentials, LoopbackNet, Node};

/// In-process overlay simulation: spins up a mesh of routing nodes over the
/// loopback transport, exchanges direct and group traffic, and reports
/// delivery counts.
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of overlay nodes to run.
    #[arg(short, long, default_value = "8")]
    nodes: usize,

    /// Group messages to originate once the mesh settles.
    #[arg(short, long, default_value = "4")]
    messages: usize,

    /// Base port for loopback endpoints.
    #[arg(long, default_value = "9000")]
    base_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes < 2 {
        anyhow::bail!("a mesh needs at least two nodes");
    }

    let net = LoopbackNet::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    let mut nodes = Vec::with_capacity(args.nodes);

    for index in 0..args.nodes {
        let endpoint: SocketAddr =
            format!("127.0.0.1:{}", args.base_port + index as u16).parse()?;
        let node = Arc::new(Node::new(
            Config::default(),
            Credentials::generate(),
            net.transport(endpoint),
        ));

        // Drain deliveries; echo requests so request/response works.
        let mut rx = node.messages().await?;
        let counter = delivered.clone();
        tokio::spawn(async move {
            while let Some(received) = rx.recv().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = received.reply {
                    let _ = reply.send(received.data);
                }
            }
        });

        if index == 0 {
            node.start_first(endpoint).await?;
        } else {
            let seed: SocketAddr = format!("127.0.0.1:{}", args.base_port).parse()?;
            node.join(vec![seed]).await?;
        }
        nodes.push(node);
    }

    // Let the handshakes and closest-set exchanges settle.
    let expected = (args.nodes - 1).min(4);
    for node in &nodes {
        if let Err(e) = node
            .wait_for_peers(expected, Duration::from_secs(10))
            .await
        {
            warn!(node = %debug_id(&node.self_id()), error = %e, "slow to acquire peers");
        }
    }
    for node in &nodes {
        info!(
            node = %debug_id(&node.self_id()),
            peers = node.peer_count(),
            "mesh member ready"
        );
    }

    // Group traffic toward member ids: each message should reach the
    // target's closest peers.
    for index in 0..args.messages {
        let origin = &nodes[index % nodes.len()];
        let target = nodes[(index + 1) % nodes.len()].self_id();
        origin
            .send_group(target, format!("group-payload-{index}").into_bytes())
            .await?;
    }

    // A direct request across the mesh, echoed back by the receiver task.
    let target = nodes[args.nodes - 1].self_id();
    match nodes[1].request(target, b"echo?".to_vec()).await {
        Ok(reply) => info!(reply = %String::from_utf8_lossy(&reply), "request answered"),
        Err(e) => warn!(error = %e, "request failed"),
    }

    sleep(Duration::from_millis(500)).await;
    info!(
        nodes = args.nodes,
        group_messages = args.messages,
        deliveries = delivered.load(Ordering::SeqCst),
        "simulation complete"
    );

    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
