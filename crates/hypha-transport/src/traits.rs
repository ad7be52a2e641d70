//! Transport and discovery traits consumed by the protocol core.

use async_trait::async_trait;
use hypha_crypto::{NodeId, TopicHash};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// A reliable, ordered byte stream to one peer.
///
/// Anything that reads and writes bytes qualifies: TCP sockets, in-memory
/// duplex pipes, encrypted tunnels provided by a discovery overlay.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased peer stream.
pub type BoxedStream = Box<dyn PeerStream>;

/// Which side initiated the underlying transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A newly connected peer reported by the discovery service.
pub struct DiscoveryEvent {
    pub stream: BoxedStream,
    pub direction: Direction,
    /// Identity the overlay believes is on the other end. Never trusted:
    /// only a verified handshake establishes a peer's node id.
    pub peer_hint: Option<NodeId>,
}

impl std::fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEvent")
            .field("direction", &self.direction)
            .field("peer_hint", &self.peer_hint)
            .finish_non_exhaustive()
    }
}

/// Peer discovery overlay (DHT, static peer list, in-memory hub).
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Join a topic. Each newly connected peer arrives on the returned channel;
    /// the channel closes when the topic is left.
    async fn join(&self, topic: TopicHash) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError>;

    /// Stop announcing on and accepting peers for a topic.
    async fn leave(&self, topic: &TopicHash) -> Result<(), TransportError>;
}

/// Common transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Already joined topic {0}")]
    AlreadyJoined(TopicHash),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}
