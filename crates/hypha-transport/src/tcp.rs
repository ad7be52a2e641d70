//! Plain TCP discovery: a listening socket plus a static list of peers.
//!
//! Stands in for a DHT overlay on a LAN or in a test cluster. Inbound
//! sockets are reported without a peer hint; dialed sockets carry none
//! either, since an address says nothing about who is listening on it.

use crate::connection::DialBackoff;
use crate::traits::{Direction, Discovery, DiscoveryEvent, TransportError};
use async_trait::async_trait;
use hypha_crypto::TopicHash;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const EVENT_QUEUE: usize = 64;
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

struct ActiveTopic {
    topic: TopicHash,
    tasks: Vec<JoinHandle<()>>,
}

/// TCP-backed [`Discovery`]. Only one topic can be joined at a time.
pub struct TcpDiscovery {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    peers: Vec<SocketAddr>,
    base_delay: Duration,
    max_delay: Duration,
    active: Mutex<Option<ActiveTopic>>,
}

impl TcpDiscovery {
    /// Bind the listening socket. Use port 0 for an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Arc::new(listener),
            local_addr,
            peers: Vec::new(),
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            active: Mutex::new(None),
        })
    }

    /// Peers to dial whenever a topic is joined.
    pub fn with_peers(mut self, peers: Vec<SocketAddr>) -> Self {
        self.peers = peers;
        self
    }

    /// Configure the dial retry backoff bounds.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn spawn_accept_loop(&self, tx: mpsc::Sender<DiscoveryEvent>) -> JoinHandle<()> {
        let listener = self.listener.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!(%remote, "accepted tcp peer");
                        let _ = stream.set_nodelay(true);
                        let event = DiscoveryEvent {
                            stream: Box::new(stream),
                            direction: Direction::Inbound,
                            peer_hint: None,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                }
            }
        })
    }

    fn spawn_dialer(&self, addr: SocketAddr, tx: mpsc::Sender<DiscoveryEvent>) -> JoinHandle<()> {
        let backoff = DialBackoff::new(None, self.base_delay, self.max_delay);
        tokio::spawn(async move {
            let dialed = backoff
                .retry(|| async move {
                    TcpStream::connect(addr)
                        .await
                        .map_err(TransportError::from)
                })
                .await;
            match dialed {
                Ok(stream) => {
                    tracing::debug!(%addr, "dialed tcp peer");
                    let _ = stream.set_nodelay(true);
                    let _ = tx
                        .send(DiscoveryEvent {
                            stream: Box::new(stream),
                            direction: Direction::Outbound,
                            peer_hint: None,
                        })
                        .await;
                }
                Err(e) => tracing::warn!(%addr, error = %e, "giving up on tcp peer"),
            }
        })
    }
}

#[async_trait]
impl Discovery for TcpDiscovery {
    async fn join(&self, topic: TopicHash) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            return Err(TransportError::AlreadyJoined(current.topic));
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let mut tasks = Vec::with_capacity(self.peers.len() + 1);
        tasks.push(self.spawn_accept_loop(tx.clone()));
        for addr in &self.peers {
            tasks.push(self.spawn_dialer(*addr, tx.clone()));
        }
        *active = Some(ActiveTopic { topic, tasks });
        tracing::debug!(%topic, addr = %self.local_addr, peers = self.peers.len(), "joined tcp topic");
        Ok(rx)
    }

    async fn leave(&self, topic: &TopicHash) -> Result<(), TransportError> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|a| &a.topic == topic) {
            if let Some(current) = active.take() {
                for task in current.tasks {
                    task.abort();
                }
            }
        }
        Ok(())
    }
}

impl Drop for TcpDiscovery {
    fn drop(&mut self) {
        if let Some(current) = self.active.get_mut().take() {
            for task in current.tasks {
                task.abort();
            }
        }
    }
}
