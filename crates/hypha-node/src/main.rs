use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hypha_core::Node;
use hypha_node::config::DaemonConfig;
use hypha_node::daemon::{log_peer_states, metrics_subscriber, run};
use hypha_transport::{TcpDiscovery, TracingSink};
use tracing::debug;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hypha-node")]
#[command(about = "Hypha node - authenticated context streaming between peers on a topic")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "HYPHA_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept peers on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Peers to dial, comma separated
    #[arg(short, long, value_delimiter = ',')]
    peers: Vec<SocketAddr>,

    /// Topic name
    #[arg(short, long)]
    topic: Option<String>,

    /// Passphrase to derive the node identity from
    #[arg(long, conflicts_with = "seed")]
    seed_phrase: Option<String>,

    /// 64-character hex master seed
    #[arg(long)]
    seed: Option<String>,

    /// Seconds between demo broadcasts (0 disables)
    #[arg(long)]
    context_interval: Option<u64>,

    /// Log filter
    #[arg(long, env = "HYPHA_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if !self.peers.is_empty() {
            config.peers = self.peers.clone();
        }
        if let Some(topic) = &self.topic {
            config.node.topic = topic.clone();
        }
        // A seed given on the command line replaces either configured form.
        if let Some(phrase) = &self.seed_phrase {
            config.node.seed_phrase = Some(phrase.clone());
            config.node.seed_hex = None;
        }
        if let Some(seed) = &self.seed {
            config.node.seed_hex = Some(seed.clone());
            config.node.seed_phrase = None;
        }
        if let Some(secs) = self.context_interval {
            config.context_interval_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Metrics lines go to stdout as-is.
    metrics_subscriber(
        EnvFilter::try_new(&args.log_level).context("invalid log filter")?,
        std::io::stdout,
    )
    .init();

    let mut config = DaemonConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let discovery = TcpDiscovery::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?
        .with_peers(config.peers.clone());
    let listen_addr = discovery.local_addr();

    let node = Node::from_config(&config.node, Arc::new(discovery), Arc::new(TracingSink))?;
    debug!(%listen_addr, peers = config.peers.len(), "discovery bound");

    let _states = log_peer_states(&node);
    node.start().await?;

    run(&node, config.context_interval_secs, tokio::signal::ctrl_c()).await
}
