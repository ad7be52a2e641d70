//! Shared helpers for node-level tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hypha_core::{Node, NodeConfig};
use hypha_crypto::NodeIdentity;
use hypha_transport::{
    encode, Direction, FrameDecoder, Handshake, MemoryNetwork, MemorySink, Message,
    MockDiscovery,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(5);

/// Short timers so tests do not sit on the 5 s production defaults.
pub fn fast_config() -> NodeConfig {
    NodeConfig {
        handshake_timeout_ms: 500,
        heartbeat_interval_ms: 100,
        ..Default::default()
    }
}

pub fn memory_node(network: &MemoryNetwork, phrase: &str, config: &NodeConfig) -> (Node, Arc<MemorySink>) {
    let identity = NodeIdentity::from_phrase(phrase);
    let discovery = Arc::new(network.endpoint(identity.node_id()));
    let sink = MemorySink::new();
    let node = Node::new(identity, config, discovery, sink.clone()).unwrap();
    (node, sink)
}

pub fn mock_node(phrase: &str, config: &NodeConfig) -> (Node, Arc<MockDiscovery>, Arc<MemorySink>) {
    let discovery = MockDiscovery::new();
    let sink = MemorySink::new();
    let node = Node::new(
        NodeIdentity::from_phrase(phrase),
        config,
        discovery.clone(),
        sink.clone(),
    )
    .unwrap();
    (node, discovery, sink)
}

/// Wait for an event (timestamp stripped) starting with `prefix`.
pub async fn expect_event(sink: &MemorySink, prefix: &str) -> String {
    match sink.wait_for(prefix, WAIT).await {
        Some(event) => event,
        None => panic!("no `{prefix}` event; saw {:#?}", sink.events()),
    }
}

/// Latency reported by an `RX_HEARTBEAT LAT=<ms>ms ...` event.
pub fn latency_of(event: &str) -> u64 {
    event
        .split(' ')
        .find_map(|field| field.strip_prefix("LAT="))
        .and_then(|lat| lat.strip_suffix("ms"))
        .and_then(|ms| ms.parse().ok())
        .unwrap_or_else(|| panic!("not a heartbeat event: {event}"))
}

/// Join two test-side pipe ends. Bytes from `a` are held until `a_to_b` has
/// passed since the call, bytes from `b` until `b_to_a`; after that they flow
/// freely.
pub fn splice(a: DuplexStream, b: DuplexStream, a_to_b: Duration, b_to_a: Duration) {
    let now = Instant::now();
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    tokio::spawn(forward(a_read, b_write, now + a_to_b));
    tokio::spawn(forward(b_read, a_write, now + b_to_a));
}

async fn forward<R, W>(mut from: R, mut to: W, release_at: Instant)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        tokio::time::sleep_until(release_at).await;
        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = to.shutdown().await;
}

/// Hand-driven peer speaking raw frames over a duplex pipe.
pub struct RawPeer {
    stream: DuplexStream,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            decoder: FrameDecoder::default(),
        }
    }

    /// Connect to a started node through its mock discovery.
    pub fn connect(discovery: &MockDiscovery) -> Self {
        let stream = discovery
            .connect_raw(Direction::Inbound, None)
            .expect("node must be started before peers connect");
        Self::new(stream)
    }

    /// Next message from the node, or `None` on EOF.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.decoder.decode_stream(&mut self.buf).unwrap() {
                return Some(message);
            }
            match tokio::time::timeout(WAIT, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return None,
                Ok(Ok(_)) => {}
                Err(_) => panic!("timed out waiting for a message"),
            }
        }
    }

    /// Next context payload, skipping heartbeats.
    pub async fn recv_context(&mut self) -> Option<Bytes> {
        loop {
            match self.recv().await? {
                Message::ContextStream { payload, .. } => return Some(payload),
                Message::Heartbeat { .. } => continue,
                other => panic!("expected context, got {other:?}"),
            }
        }
    }

    pub async fn send(&mut self, message: &Message) {
        self.send_raw(&encode(message)).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Read the node's handshake, then answer with `identity`'s.
    pub async fn handshake(&mut self, identity: &NodeIdentity) -> Handshake {
        let theirs = match self.recv().await {
            Some(Message::Handshake(handshake)) => handshake,
            other => panic!("expected handshake, got {other:?}"),
        };
        self.send(&Message::Handshake(Handshake::new_signed(identity))).await;
        theirs
    }

    /// Handshake and wait for the node's first heartbeat.
    pub async fn authenticate(&mut self, identity: &NodeIdentity) -> Handshake {
        let theirs = self.handshake(identity).await;
        match self.recv().await {
            Some(Message::Heartbeat { .. }) => theirs,
            other => panic!("expected heartbeat after handshake, got {other:?}"),
        }
    }

    /// Drain until the node closes the stream.
    pub async fn expect_eof(&mut self) {
        while self.recv().await.is_some() {}
    }
}
