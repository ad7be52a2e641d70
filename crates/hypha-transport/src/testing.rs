//! In-process discovery backends for tests and local simulations.

use crate::traits::{Direction, Discovery, DiscoveryEvent, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use hypha_crypto::{NodeId, TopicHash};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

/// Capacity of each endpoint's discovery event queue.
const EVENT_QUEUE: usize = 256;
/// In-flight byte capacity of each simulated link.
const LINK_BUFFER: usize = 64 * 1024;

struct Member {
    node_id: NodeId,
    events: mpsc::Sender<DiscoveryEvent>,
}

/// In-process discovery hub.
///
/// Every pair of endpoints joined to the same topic is linked by a
/// `tokio::io::duplex` pipe: the endpoint that joined first sees an
/// `Inbound` stream, the newcomer an `Outbound` one. Both are hinted with the
/// other side's node id.
#[derive(Clone)]
pub struct MemoryNetwork {
    topics: Arc<DashMap<TopicHash, Vec<Member>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
        }
    }

    /// Discovery endpoint for a node with the given id.
    pub fn endpoint(&self, local: NodeId) -> MemoryDiscovery {
        MemoryDiscovery {
            network: self.clone(),
            local,
        }
    }

    /// Number of endpoints currently joined to `topic`.
    pub fn members(&self, topic: &TopicHash) -> usize {
        self.topics.get(topic).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryDiscovery {
    network: MemoryNetwork,
    local: NodeId,
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn join(&self, topic: TopicHash) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let mut members = self.network.topics.entry(topic).or_default();
        members.retain(|m| !m.events.is_closed());
        if members.iter().any(|m| m.node_id == self.local) {
            return Err(TransportError::AlreadyJoined(topic));
        }

        for member in members.iter() {
            let (theirs, ours) = tokio::io::duplex(LINK_BUFFER);
            let inbound = DiscoveryEvent {
                stream: Box::new(theirs),
                direction: Direction::Inbound,
                peer_hint: Some(self.local),
            };
            if member.events.try_send(inbound).is_err() {
                tracing::debug!(peer = %member.node_id, "memory discovery queue full, skipping peer");
                continue;
            }
            let outbound = DiscoveryEvent {
                stream: Box::new(ours),
                direction: Direction::Outbound,
                peer_hint: Some(member.node_id),
            };
            // Fresh channel with more capacity than any topic we simulate.
            let _ = tx.try_send(outbound);
        }

        members.push(Member {
            node_id: self.local,
            events: tx,
        });
        Ok(rx)
    }

    async fn leave(&self, topic: &TopicHash) -> Result<(), TransportError> {
        if let Some(mut members) = self.network.topics.get_mut(topic) {
            members.retain(|m| m.node_id != self.local);
        }
        Ok(())
    }
}

/// Discovery stub whose peers are injected by the test.
#[derive(Default)]
pub struct MockDiscovery {
    events: Mutex<Option<mpsc::Sender<DiscoveryEvent>>>,
    joins: AtomicUsize,
    leaves: AtomicUsize,
}

impl MockDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand a stream to the joined node. Returns `false` if nothing is joined.
    pub fn inject(&self, event: DiscoveryEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Create a duplex link, inject one end and return the other for the test
    /// to drive by hand.
    pub fn connect_raw(&self, direction: Direction, peer_hint: Option<NodeId>) -> Option<DuplexStream> {
        let (node_side, test_side) = tokio::io::duplex(LINK_BUFFER);
        let injected = self.inject(DiscoveryEvent {
            stream: Box::new(node_side),
            direction,
            peer_hint,
        });
        injected.then_some(test_side)
    }

    pub fn join_count(&self) -> usize {
        self.joins.load(Ordering::Relaxed)
    }

    pub fn leave_count(&self) -> usize {
        self.leaves.load(Ordering::Relaxed)
    }

    pub fn is_joined(&self) -> bool {
        self.events.lock().is_some()
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn join(&self, topic: TopicHash) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        let mut events = self.events.lock();
        if events.is_some() {
            return Err(TransportError::AlreadyJoined(topic));
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        *events = Some(tx);
        self.joins.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    async fn leave(&self, _topic: &TopicHash) -> Result<(), TransportError> {
        if self.events.lock().take().is_some() {
            self.leaves.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
