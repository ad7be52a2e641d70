//! The daemon's run loop and its stdout logging.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use hypha_core::Node;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::demo::TrainingState;

/// Subscriber that writes each event's message and nothing else, so the
/// metrics lines reach `writer` untouched.
pub fn metrics_subscriber<W>(filter: EnvFilter, writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .without_time()
        .with_level(false)
        .with_target(false)
        .finish()
}

/// Log decoded training states received from peers.
pub fn log_peer_states(node: &Node) -> hypha_core::ListenerHandle {
    node.on_context(|peer, payload| match TrainingState::decode(&payload) {
        Ok(state) => debug!(
            %peer,
            iteration = state.iteration,
            checkpoint = %state.checkpoint,
            loss = state.loss,
            "peer training state"
        ),
        Err(_) => debug!(%peer, bytes = payload.len(), "opaque context"),
    })
}

/// Broadcast a training state every `interval_secs` (never if 0) until
/// `shutdown` resolves, then stop the node.
pub async fn run<S>(node: &Node, interval_secs: u64, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = std::io::Result<()>>,
{
    let mut broadcast = (interval_secs > 0).then(|| {
        let period = Duration::from_secs(interval_secs);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut iteration = 0u64;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("waiting for shutdown signal")?;
                debug!("shutdown signal received");
                break;
            }
            _ = next_tick(&mut broadcast) => {
                let state = TrainingState::at(iteration);
                iteration += 1;
                let sent = node.stream_context(state.encode()?);
                debug!(iteration = state.iteration, sent, "broadcast training state");
            }
        }
    }

    if let Err(e) = node.stop().await {
        warn!(error = %e, "node did not stop cleanly");
    }
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
